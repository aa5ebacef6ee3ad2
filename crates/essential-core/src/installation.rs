//! Stable per-installation identifier: generated once from the OS CSPRNG,
//! persisted in a [`SecureStore`], and read back unchanged afterwards.

use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::{Builder, Uuid};

use crate::storage::{SecureStore, SecureStoreError};

/// Well-known key the installation identifier lives under.
pub const INSTALLATION_ID_KEY: &str = "installation/id";

/// Length of the hyphenated 8-4-4-4-12 textual form.
pub const INSTALLATION_ID_LEN: usize = 36;

/// Why an identifier could not be made durable.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallationIdError {
    /// The secure store could not be reached or queried.
    #[error("secure store unavailable: {reason}")]
    StoreUnavailable { reason: String },
    /// A fresh identifier was generated but persisting it failed.
    #[error("failed to persist installation id: {reason}")]
    WriteFailed { reason: String },
}

/// Where a resolved identifier came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    /// Read back from the store.
    Existing,
    /// Generated on this call and persisted.
    Created,
    /// Generated on this call but not persisted; the next call may differ.
    Ephemeral(InstallationIdError),
}

/// Outcome of [`InstallationIdStore::get_or_create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub id: String,
    pub source: IdSource,
}

impl Resolution {
    /// `true` unless the identifier exists only in this process.
    pub fn is_durable(&self) -> bool {
        !matches!(self.source, IdSource::Ephemeral(_))
    }

    /// Strict view: degraded resolutions become their error.
    pub fn into_result(self) -> Result<String, InstallationIdError> {
        match self.source {
            IdSource::Ephemeral(err) => Err(err),
            IdSource::Existing | IdSource::Created => Ok(self.id),
        }
    }
}

enum Lookup {
    Found(String),
    Missing,
    Malformed,
}

/// Issues the installation identifier from an explicitly provided store.
///
/// Concurrent first use is tolerated rather than prevented: two callers may
/// both create, and whichever write lands last is what later reads return.
pub struct InstallationIdStore<S: SecureStore> {
    store: Arc<S>,
}

impl<S: SecureStore> InstallationIdStore<S> {
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Backing store, for callers that need out-of-band access (e.g. a reset).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Host-facing entry point: the identifier under [`INSTALLATION_ID_KEY`],
    /// created on first call. Never fails; see [`Self::get_or_create`].
    pub async fn get_or_create_installation_id(&self) -> String {
        self.get_or_create(INSTALLATION_ID_KEY).await.id
    }

    /// Return the identifier stored under `key`, generating and persisting one
    /// if absent, malformed, or reported [`SecureStoreError::Corrupt`].
    ///
    /// Store failures degrade instead of propagating: the caller still gets a
    /// valid identifier, flagged [`IdSource::Ephemeral`]. When the read itself
    /// fails nothing is written, so an existing value that merely could not be
    /// read this time is left intact.
    #[instrument(skip(self))]
    pub async fn get_or_create(&self, key: &str) -> Resolution {
        match self.lookup(key).await {
            Ok(Lookup::Found(id)) => {
                return Resolution {
                    id,
                    source: IdSource::Existing,
                }
            }
            Ok(Lookup::Missing) => debug!("no installation id stored, creating one"),
            Ok(Lookup::Malformed) => warn!("stored installation id is malformed, regenerating"),
            Err(err) => {
                warn!(error = %err, "issuing ephemeral installation id");
                return Resolution {
                    id: generate_installation_id(),
                    source: IdSource::Ephemeral(err),
                };
            }
        }

        let id = generate_installation_id();
        match self.store.put(key, id.as_bytes()).await {
            Ok(()) => Resolution {
                id,
                source: IdSource::Created,
            },
            Err(err) => {
                let err = InstallationIdError::WriteFailed {
                    reason: err.to_string(),
                };
                warn!(error = %err, "issuing ephemeral installation id");
                Resolution {
                    id,
                    source: IdSource::Ephemeral(err),
                }
            }
        }
    }

    /// Like [`Self::get_or_create`], but surfaces store failures as errors.
    pub async fn try_get_or_create(&self, key: &str) -> Result<String, InstallationIdError> {
        self.get_or_create(key).await.into_result()
    }

    /// Read the identifier under `key` without creating one.
    /// Malformed values are reported as absent.
    #[instrument(skip(self))]
    pub async fn current(&self, key: &str) -> Result<Option<String>, InstallationIdError> {
        match self.lookup(key).await? {
            Lookup::Found(id) => Ok(Some(id)),
            Lookup::Missing | Lookup::Malformed => Ok(None),
        }
    }

    async fn lookup(&self, key: &str) -> Result<Lookup, InstallationIdError> {
        match self.store.get(key).await {
            Ok(bytes) => Ok(match String::from_utf8(bytes) {
                Ok(text) if is_installation_id(&text) => Lookup::Found(text),
                _ => Lookup::Malformed,
            }),
            Err(SecureStoreError::NotFound { .. }) => Ok(Lookup::Missing),
            Err(SecureStoreError::Corrupt { reason, .. }) => {
                warn!(%reason, "stored installation id cannot be read back");
                Ok(Lookup::Malformed)
            }
            Err(err) => Err(InstallationIdError::StoreUnavailable {
                reason: err.to_string(),
            }),
        }
    }
}

/// Fresh random (version 4) UUID in lowercase hyphenated form.
pub fn generate_installation_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

/// Whether `value` is a 36-character 8-4-4-4-12 hex UUID string.
///
/// Hex digits may be either case. Ids generated here are always lowercase, but
/// an uppercase value already in the store (e.g. written by an older client)
/// is accepted and returned unchanged rather than rotated.
pub fn is_installation_id(value: &str) -> bool {
    value.len() == INSTALLATION_ID_LEN && Uuid::try_parse(value).is_ok()
}
