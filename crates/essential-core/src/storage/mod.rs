mod secure_store;

pub use secure_store::{InMemorySecureStore, SecureStore, SecureStoreError};
