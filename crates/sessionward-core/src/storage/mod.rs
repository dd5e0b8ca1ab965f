//! Durable key-value storage backends.
//!
//! The session layer only needs `get`/`set`/`remove` over string values.
//! Backends:
//! - `MemoryStorage`: shared in-process map, observable, used for tabs of one origin
//! - `FileStorage`: one file per key in a directory
//! - `KeyringStorage`: OS keychain entries via keyring

pub mod file;
pub mod keychain;
pub mod memory;

use anyhow::Result;
use tokio::sync::broadcast;

pub use self::file::FileStorage;
pub use self::keychain::KeyringStorage;
pub use self::memory::MemoryStorage;

pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// A write observed on shared storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Storage that publishes change notifications to every handle sharing it.
pub trait ObservableStorage: KeyValueStorage {
    fn watch(&self) -> broadcast::Receiver<StorageChange>;
}
