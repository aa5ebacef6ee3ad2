use async_trait::async_trait;
use essential_core::storage::{SecureStore, SecureStoreError};
use keyring::Entry;
use tracing::instrument;

/// `SecureStore` holding each value directly as an OS credential
/// (macOS/iOS keychain, Windows credential manager, Linux kernel keyring).
/// Entries are addressed by (`service`, key).
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, key: &str) -> Result<Entry, SecureStoreError> {
        Entry::new(&self.service, key).map_err(|err| classify(key, err))
    }
}

#[async_trait]
impl SecureStore for KeychainStore {
    #[instrument(skip_all, fields(key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        read_slot(&self.entry(key)?, key)
    }

    #[instrument(skip_all, fields(key))]
    async fn add(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        add_to_slot(&self.entry(key)?, key, value)
    }

    #[instrument(skip_all, fields(key))]
    async fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        clear_slot(&self.entry(key)?, key)
    }
}

/// The single credential a keychain entry points at.
trait CredentialSlot {
    fn read(&self) -> keyring::Result<Vec<u8>>;
    fn write(&self, value: &[u8]) -> keyring::Result<()>;
    fn remove(&self) -> keyring::Result<()>;
}

impl CredentialSlot for Entry {
    fn read(&self) -> keyring::Result<Vec<u8>> {
        self.get_secret()
    }

    fn write(&self, value: &[u8]) -> keyring::Result<()> {
        self.set_secret(value)
    }

    fn remove(&self) -> keyring::Result<()> {
        self.delete_credential()
    }
}

fn read_slot(slot: &impl CredentialSlot, key: &str) -> Result<Vec<u8>, SecureStoreError> {
    slot.read().map_err(|err| classify(key, err))
}

// Credential stores overwrite on set, so insert-only has to be checked first.
fn add_to_slot(
    slot: &impl CredentialSlot,
    key: &str,
    value: &[u8],
) -> Result<(), SecureStoreError> {
    match slot.read() {
        Ok(_) => {
            return Err(SecureStoreError::Duplicate {
                key: key.to_string(),
            })
        }
        Err(keyring::Error::NoEntry) => {}
        Err(err) => return Err(classify(key, err)),
    }
    slot.write(value).map_err(|err| classify(key, err))
}

fn clear_slot(slot: &impl CredentialSlot, key: &str) -> Result<(), SecureStoreError> {
    match slot.remove() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(classify(key, err)),
    }
}

fn classify(key: &str, err: keyring::Error) -> SecureStoreError {
    match err {
        keyring::Error::NoEntry => SecureStoreError::NotFound {
            key: key.to_string(),
        },
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
            SecureStoreError::Unavailable {
                reason: err.to_string(),
            }
        }
        keyring::Error::BadEncoding(_) => SecureStoreError::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        },
        other => SecureStoreError::Storage {
            reason: other.to_string(),
        },
    }
}
