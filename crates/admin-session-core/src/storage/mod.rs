//! Persistent key-value storage for the session credential.
//!
//! The credential is two string entries: `access_token` (the bearer token)
//! and `user` (the JSON-serialized profile). Backends:
//! - `MemoryStorage`: process-local map, lost on exit
//! - `FileStorage`: JSON object file in the data directory
//! - `KeyringStorage`: one OS keychain entry per key

pub mod file;
pub mod keychain;
pub mod memory;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::file::FileStorage;
pub use self::keychain::KeyringStorage;
pub use self::memory::MemoryStorage;

/// Key holding the bearer token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Key holding the JSON-serialized user profile
pub const USER_KEY: &str = "user";

/// Keychain service name for `KeyringStorage`
pub const KEYRING_SERVICE: &str = "admin-session";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// A string key-value store shared by everything in the process.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove an entry. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

/// Open the configured backend. `data_dir` is only used by `StorageKind::File`.
pub fn open(kind: StorageKind, data_dir: &Path) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match kind {
        StorageKind::File => Arc::new(FileStorage::in_dir(data_dir)?),
        StorageKind::Keyring => Arc::new(KeyringStorage::new(KEYRING_SERVICE)),
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
    };
    Ok(storage)
}
