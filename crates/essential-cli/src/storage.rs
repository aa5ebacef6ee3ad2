use std::path::PathBuf;

use crate::config::{Backend, Config};
use async_trait::async_trait;
use color_eyre::Result;
use dirs::data_dir;
use essential_core::storage::{SecureStore, SecureStoreError};
use essential_storage::{
    key_provider::KeyringProvider, keychain_store::KeychainStore,
    secure_file_store::EncryptedFileStore,
};
use tracing::debug;

/// Keyring account holding the file backend's data key.
const DATA_KEY_ACCOUNT: &str = "data-key";

/// The secure store selected by configuration.
pub enum AppStore {
    File(EncryptedFileStore<KeyringProvider>),
    Keychain(KeychainStore),
}

#[async_trait]
impl SecureStore for AppStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        match self {
            Self::File(store) => store.get(key).await,
            Self::Keychain(store) => store.get(key).await,
        }
    }

    async fn add(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        match self {
            Self::File(store) => store.add(key, value).await,
            Self::Keychain(store) => store.add(key, value).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        match self {
            Self::File(store) => store.delete(key).await,
            Self::Keychain(store) => store.delete(key).await,
        }
    }
}

/// Resolve the default data directory for Essential.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("essential"))
}

/// Build the store named by the config, honouring its overrides.
pub fn store_from_config(config: &Config) -> Result<AppStore> {
    let service = config.service();
    match config.backend {
        Backend::Keychain => {
            debug!(service = %service, "initializing keychain store");
            Ok(AppStore::Keychain(KeychainStore::new(service)))
        }
        Backend::File => {
            let root = match &config.data_dir {
                Some(root) => root.clone(),
                None => default_data_dir()?,
            };
            debug!(?root, service = %service, "initializing encrypted store");
            Ok(AppStore::File(EncryptedFileStore::new(
                root,
                KeyringProvider::new(service, DATA_KEY_ACCOUNT),
            )))
        }
    }
}

/// Helper for tests to construct a store rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_store(
    root: impl Into<PathBuf>,
) -> EncryptedFileStore<essential_storage::key_provider::InMemoryKeyProvider> {
    EncryptedFileStore::new(root, Default::default())
}
