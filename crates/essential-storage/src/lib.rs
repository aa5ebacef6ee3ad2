//! Concrete secure store backends.
//! `KeychainStore` keeps values in the OS credential store; `EncryptedFileStore`
//! seals them with AES-GCM under a data key sourced from the OS keyring
//! (or test doubles).

pub mod key_provider;
pub mod keychain_store;
pub mod secure_file_store;
