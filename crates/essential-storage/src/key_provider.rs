use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::{debug, instrument};

/// Size of the AES-256 data key in bytes.
pub const DATA_KEY_LEN: usize = 32;

/// Symmetric key the encrypted file store seals entries with.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey {
    bytes: [u8; DATA_KEY_LEN],
}

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; DATA_KEY_LEN] = raw.try_into().map_err(|_| {
            KeyError::Corrupt(format!("expected {DATA_KEY_LEN} bytes, got {}", raw.len()))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; DATA_KEY_LEN] {
        &self.bytes
    }
}

// Never print key bytes.
impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    /// The OS credential store refused or could not be reached.
    #[error("keyring unavailable: {0}")]
    Unavailable(String),
    /// A key exists but is not usable key material.
    #[error("stored data key is corrupt: {0}")]
    Corrupt(String),
}

/// Provides the data key, creating it on first use.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn data_key(&self) -> Result<DataKey, KeyError>;
}

/// OS keyring-backed provider. The key is loaded once per process and cached.
pub struct KeyringProvider {
    service: String,
    account: String,
    cached: Mutex<Option<DataKey>>,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
            cached: Mutex::new(None),
        }
    }

    fn load_or_create(&self) -> Result<DataKey, KeyError> {
        let entry = keyring::Entry::new(&self.service, &self.account).map_err(keyring_err)?;
        match entry.get_secret() {
            Ok(secret) => DataKey::from_slice(&secret),
            Err(keyring::Error::NoEntry) => {
                debug!(service = %self.service, "generating new data key");
                let key = DataKey::generate();
                entry.set_secret(key.as_bytes()).map_err(keyring_err)?;
                Ok(key)
            }
            Err(err) => Err(keyring_err(err)),
        }
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    #[instrument(skip_all)]
    async fn data_key(&self) -> Result<DataKey, KeyError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|err| KeyError::Unavailable(format!("lock poisoned: {err}")))?;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        // Keyring calls are synchronous and short; no need to leave the executor.
        let key = self.load_or_create()?;
        *cached = Some(key.clone());
        Ok(key)
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<DataKey>>>,
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn data_key(&self) -> Result<DataKey, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Unavailable(format!("lock poisoned: {err}")))?;
        Ok(guard.get_or_insert_with(DataKey::generate).clone())
    }
}

fn keyring_err(err: keyring::Error) -> KeyError {
    match err {
        keyring::Error::BadEncoding(_) => KeyError::Corrupt(err.to_string()),
        other => KeyError::Unavailable(other.to_string()),
    }
}
