use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors produced by secure storage implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecureStoreError {
    /// Requested key does not exist.
    #[error("entry not found for key: {key}")]
    NotFound { key: String },
    /// An insert-only write hit an existing entry.
    #[error("entry already exists for key: {key}")]
    Duplicate { key: String },
    /// An entry exists but can never be read back (undecryptable or garbled).
    /// Unlike [`SecureStoreError::Unavailable`], retrying will not help.
    #[error("entry for key {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    /// The backing facility (keychain, data directory, data key) cannot be reached.
    #[error("secure store unavailable: {reason}")]
    Unavailable { reason: String },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// Keychain-shaped contract for app-private, encrypted-at-rest values.
///
/// Writes are insert-only like a native keychain item: replacing a value means
/// removing the old entry first, which [`SecureStore::put`] does for callers.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Retrieve the value for a key.
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError>;

    /// Insert a value; fails with [`SecureStoreError::Duplicate`] if the key is taken.
    async fn add(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError>;

    /// Remove a key and its value (idempotent).
    async fn delete(&self, key: &str) -> Result<(), SecureStoreError>;

    /// Persist a value under a key, replacing any existing entry.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        self.delete(key).await?;
        match self.add(key, value).await {
            Err(SecureStoreError::Duplicate { .. }) => {
                // Another writer landed between delete and add; last write wins.
                debug!(key = %key, "entry reappeared during replace, retrying once");
                self.delete(key).await?;
                self.add(key, value).await
            }
            other => other,
        }
    }
}

/// In-memory secure store that simulates encryption for tests and smoke runs.
/// This is not cryptographically secure; use a keychain or encrypted file
/// backend for anything that must survive the process.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecureStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, as an uninstall or keychain reset would.
    pub fn wipe(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, SecureStoreError> {
        self.inner.lock().map_err(|err| SecureStoreError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        let map = self.lock()?;
        let masked = map
            .get(key)
            .ok_or_else(|| SecureStoreError::NotFound {
                key: key.to_string(),
            })?;
        Ok(unmask(masked))
    }

    async fn add(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        let mut map = self.lock()?;
        if map.contains_key(key) {
            return Err(SecureStoreError::Duplicate {
                key: key.to_string(),
            });
        }
        // XOR is a placeholder to avoid storing plaintext in tests.
        map.insert(key.to_string(), mask(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

const MASK_BYTE: u8 = 0xA5;

fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}

fn unmask(input: &[u8]) -> Vec<u8> {
    mask(input) // XOR twice restores original.
}
