use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use tokio::sync::broadcast;
use tracing::trace;

use super::{KeyValueStorage, ObservableStorage, StorageChange};

/// Buffer size for pending change notifications per subscriber.
const CHANGE_BUFFER_SIZE: usize = 64;

struct Inner {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

/// In-process storage shared by every clone of the handle.
///
/// Clones model tabs of the same origin: they see the same entries and each
/// subscriber is told about writes that actually changed a value.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                changes,
            }),
        }
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        if old_value == new_value {
            return;
        }
        trace!(key, "Storage value changed");
        // No subscribers is fine
        let _ = self.inner.changes.send(StorageChange {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .inner
            .entries
            .read()
            .map_err(|_| anyhow!("storage lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let old = {
            let mut entries = self
                .inner
                .entries
                .write()
                .map_err(|_| anyhow!("storage lock poisoned"))?;
            entries.insert(key.to_string(), value.to_string())
        };
        self.publish(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let old = {
            let mut entries = self
                .inner
                .entries
                .write()
                .map_err(|_| anyhow!("storage lock poisoned"))?;
            entries.remove(key)
        };
        self.publish(key, old, None);
        Ok(())
    }
}

impl ObservableStorage for MemoryStorage {
    fn watch(&self) -> broadcast::Receiver<StorageChange> {
        self.inner.changes.subscribe()
    }
}
