use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use essential_core::storage::{SecureStore, SecureStoreError};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::instrument;

use crate::key_provider::{DataKey, KeyProvider};

/// AES-GCM encrypted file-backed store implementing the shared `SecureStore` contract.
/// One file per key under `root`; the data key comes from a `KeyProvider`
/// (OS keyring in production).
pub struct EncryptedFileStore<P: KeyProvider> {
    root: PathBuf,
    key_provider: P,
}

impl<P: KeyProvider> EncryptedFileStore<P> {
    pub fn new(root: impl Into<PathBuf>, key_provider: P) -> Self {
        Self {
            root: root.into(),
            key_provider,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }

    async fn cipher(&self) -> Result<Aes256Gcm, SecureStoreError> {
        let key = self
            .key_provider
            .data_key()
            .await
            .map_err(|e| SecureStoreError::Unavailable {
                reason: format!("key provider: {e}"),
            })?;
        build_cipher(&key)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlob {
    nonce: String,
    ciphertext: String,
}

#[async_trait]
impl<P: KeyProvider> SecureStore for EncryptedFileStore<P> {
    #[instrument(skip_all, fields(key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        let blob = read_blob(&self.path_for(key), key)?;
        let cipher = self.cipher().await?;

        let corrupt = |reason: String| SecureStoreError::Corrupt {
            key: key.to_string(),
            reason,
        };

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(blob.nonce)
            .map_err(|e| corrupt(format!("nonce decode failed: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(corrupt(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = URL_SAFE_NO_PAD
            .decode(blob.ciphertext)
            .map_err(|e| corrupt(format!("ciphertext decode failed: {e}")))?;

        // A blob sealed under a lost data key fails authentication here.
        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| corrupt(format!("decrypt failed: {e}")))
    }

    #[instrument(skip_all, fields(key))]
    async fn add(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        fs::create_dir_all(&self.root).map_err(unavailable_err)?;

        let path = self.path_for(key);
        if path.exists() {
            return Err(SecureStoreError::Duplicate {
                key: key.to_string(),
            });
        }

        let cipher = self.cipher().await?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, value)
            .map_err(|e| SecureStoreError::Storage {
                reason: format!("encrypt failed: {e}"),
            })?;

        let blob = StoredBlob {
            nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        };
        write_blob_new(&path, &blob, key)
    }

    #[instrument(skip_all, fields(key))]
    async fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }
}

const NONCE_LEN: usize = 12;

/// Atomically create `path`; a concurrent writer that got there first wins
/// and this call reports `Duplicate`.
fn write_blob_new(path: &Path, blob: &StoredBlob, key: &str) -> Result<(), SecureStoreError> {
    let parent = path.parent().ok_or_else(|| SecureStoreError::Storage {
        reason: "invalid storage path".to_string(),
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(blob).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
            Err(SecureStoreError::Duplicate {
                key: key.to_string(),
            })
        }
        Err(err) => Err(storage_err(err.error)),
    }
}

fn read_blob(path: &Path, key: &str) -> Result<StoredBlob, SecureStoreError> {
    let buf = fs::read(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => SecureStoreError::NotFound {
            key: key.to_string(),
        },
        ErrorKind::PermissionDenied => unavailable_err(err),
        _ => storage_err(err),
    })?;
    serde_json::from_slice(&buf).map_err(|e| SecureStoreError::Corrupt {
        key: key.to_string(),
        reason: format!("blob parse failed: {e}"),
    })
}

fn build_cipher(key: &DataKey) -> Result<Aes256Gcm, SecureStoreError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| SecureStoreError::Storage {
        reason: format!("cipher init failed: {e}"),
    })
}

fn sanitize_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

fn storage_err<E: ToString>(err: E) -> SecureStoreError {
    SecureStoreError::Storage {
        reason: err.to_string(),
    }
}

fn unavailable_err<E: ToString>(err: E) -> SecureStoreError {
    SecureStoreError::Unavailable {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use essential_core::installation::{IdSource, InstallationIdStore, INSTALLATION_ID_KEY};

    use super::*;
    use crate::key_provider::{InMemoryKeyProvider, KeyError};

    struct RefusingKeyProvider;

    #[async_trait]
    impl KeyProvider for RefusingKeyProvider {
        async fn data_key(&self) -> Result<DataKey, KeyError> {
            Err(KeyError::Unavailable("user denied keychain access".into()))
        }
    }

    #[tokio::test]
    async fn round_trip_encrypts_and_decrypts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(dir.path(), InMemoryKeyProvider::default());

        let key = INSTALLATION_ID_KEY;
        let value = b"67e55044-10b1-426f-9247-bb680e5fe0c8";

        store.add(key, value).await.expect("add");
        let decrypted = store.get(key).await.expect("get");
        assert_eq!(decrypted, value);

        // ensure plaintext is not present on disk
        let stored = std::fs::read_to_string(store.path_for(key)).expect("read ciphertext");
        assert!(
            !stored.contains("67e55044"),
            "plaintext must not be stored"
        );
    }

    #[tokio::test]
    async fn add_refuses_existing_file_and_put_replaces_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(dir.path(), InMemoryKeyProvider::default());

        store.add("k", b"stale").await.expect("add");
        let err = store.add("k", b"fresh").await.expect_err("duplicate");
        assert!(matches!(err, SecureStoreError::Duplicate { .. }));

        store.put("k", b"fresh").await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), b"fresh");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(dir.path(), InMemoryKeyProvider::default());
        let key = "k";
        store.put(key, b"v").await.expect("put");
        store.delete(key).await.expect("delete");
        store.delete(key).await.expect("delete again");

        let err = store.get(key).await.expect_err("should be missing");
        assert_eq!(
            err,
            SecureStoreError::NotFound {
                key: "k".to_string()
            }
        );
    }

    #[tokio::test]
    async fn missing_root_reads_as_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(
            dir.path().join("not-yet-created"),
            InMemoryKeyProvider::default(),
        );
        let err = store.get("k").await.expect_err("nothing stored");
        assert!(matches!(err, SecureStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn wrong_data_key_is_reported_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = EncryptedFileStore::new(dir.path(), InMemoryKeyProvider::default());
        writer.put("k", b"secret").await.expect("put");

        let reader = EncryptedFileStore::new(dir.path(), InMemoryKeyProvider::default());
        let err = reader.get("k").await.expect_err("different key");
        assert!(matches!(err, SecureStoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn refused_data_key_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(dir.path(), RefusingKeyProvider);
        let err = store.add("k", b"v").await.expect_err("no key");
        assert!(matches!(err, SecureStoreError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn installation_id_survives_reopening_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = InMemoryKeyProvider::default();

        let first = InstallationIdStore::new(EncryptedFileStore::new(dir.path(), keys.clone()))
            .get_or_create(INSTALLATION_ID_KEY)
            .await;
        assert_eq!(first.source, IdSource::Created);

        // Simulates a process restart: new store objects over the same files and key.
        let reopened = InstallationIdStore::new(EncryptedFileStore::new(dir.path(), keys.clone()));
        let second = reopened.get_or_create(INSTALLATION_ID_KEY).await;
        assert_eq!(second.source, IdSource::Existing);
        assert_eq!(second.id, first.id);

        reopened.store().delete(INSTALLATION_ID_KEY).await.expect("wipe");
        let third = reopened.get_or_create_installation_id().await;
        assert_ne!(third, first.id);
    }

    #[tokio::test]
    async fn garbled_blob_is_corrupt_and_gets_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(dir.path(), InMemoryKeyProvider::default());
        std::fs::write(store.path_for(INSTALLATION_ID_KEY), b"{not json").expect("seed");

        let err = store.get(INSTALLATION_ID_KEY).await.expect_err("garbled");
        assert!(matches!(err, SecureStoreError::Corrupt { .. }));

        let ids = InstallationIdStore::new(store);
        let resolved = ids.get_or_create(INSTALLATION_ID_KEY).await;
        assert_eq!(resolved.source, IdSource::Created);
        assert_eq!(ids.get_or_create_installation_id().await, resolved.id);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn installation_id_settles_after_data_key_is_lost() {
        let dir = tempfile::tempdir().expect("tempdir");

        let before = InstallationIdStore::new(EncryptedFileStore::new(
            dir.path(),
            InMemoryKeyProvider::default(),
        ))
        .get_or_create_installation_id()
        .await;

        // Keychain reset: same files, freshly generated data key.
        let ids = InstallationIdStore::new(EncryptedFileStore::new(
            dir.path(),
            InMemoryKeyProvider::default(),
        ));
        let err = ids
            .store()
            .get(INSTALLATION_ID_KEY)
            .await
            .expect_err("sealed under the old key");
        assert!(matches!(err, SecureStoreError::Corrupt { .. }));

        let first = ids.get_or_create(INSTALLATION_ID_KEY).await;
        assert_eq!(first.source, IdSource::Created);
        assert_ne!(first.id, before);

        let second = ids.get_or_create(INSTALLATION_ID_KEY).await;
        let third = ids.get_or_create(INSTALLATION_ID_KEY).await;
        assert_eq!(second.source, IdSource::Existing);
        assert_eq!(second.id, first.id);
        assert_eq!(third.id, first.id);
    }
}
