use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Keyring service name used when the config does not override it.
pub const DEFAULT_SERVICE: &str = "essential";

/// User-level configuration loaded from `~/.config/essential/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Which secure store holds the installation id.
    #[serde(default)]
    pub backend: Backend,
    /// Override for data directory (encrypted file backend).
    pub data_dir: Option<PathBuf>,
    /// Keyring service name for keychain entries and the file backend's data key.
    pub service: Option<String>,
}

impl Config {
    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or(DEFAULT_SERVICE)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// AES-GCM encrypted files, data key in the OS keyring.
    #[default]
    File,
    /// Values stored directly as OS keyring entries.
    Keychain,
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("essential").join("config.toml"))
}

/// Write the given config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_if_missing(config, &default_path()?)
}

fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.backend, Backend::File);
        assert_eq!(cfg.service(), DEFAULT_SERVICE);
    }

    #[test]
    fn returns_default_when_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write");
        assert_eq!(load_from_path(&path).expect("load"), Config::default());
    }

    #[test]
    fn parses_custom_config() {
        let contents = r#"
            backend = "keychain"
            data_dir = "/tmp/essential-data"
            service = "com.example.app"
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(
            cfg,
            Config {
                backend: Backend::Keychain,
                data_dir: Some(PathBuf::from("/tmp/essential-data")),
                service: Some("com.example.app".into()),
            }
        );
        assert_eq!(cfg.service(), "com.example.app");
    }

    #[test]
    fn rejects_unknown_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "backend = \"cloud\"\n").expect("write");
        assert!(load_from_path(&path).is_err());
    }

    #[test]
    fn write_default_creates_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            backend: Backend::File,
            data_dir: Some(PathBuf::from("/tmp/essential-data")),
            service: None,
        };

        write_if_missing(&cfg, &path).expect("write should succeed");
        let other = Config {
            backend: Backend::Keychain,
            ..Config::default()
        };
        let second = write_if_missing(&other, &path).expect("second write ok");
        assert_eq!(second, path);
        let loaded = load_from_path(&path).expect("load");
        assert_eq!(loaded, cfg);
    }
}
