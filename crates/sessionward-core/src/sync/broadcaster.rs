//! Transports for sync messages between tabs of one origin.
//!
//! Two implementations, picked by what the environment offers:
//! - `ChannelBroadcaster`: a named broadcast channel from a `BroadcastHub`
//! - `StorageEventBroadcaster`: a sentinel key on shared observable storage,
//!   for environments without a broadcast primitive

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::event::SyncMessage;
use crate::config::SessionConfig;
use crate::storage::ObservableStorage;

/// Messages buffered per subscriber before older ones are dropped.
const CHANNEL_CAPACITY: usize = 64;

pub trait SessionBroadcaster: Send + Sync {
    fn name(&self) -> &'static str;

    fn post(&self, message: &SyncMessage) -> Result<()>;

    /// Stream of every message posted after this call, including this tab's
    /// own. Must be called from within a tokio runtime.
    fn subscribe(&self) -> mpsc::Receiver<SyncMessage>;
}

/// Registry of named broadcast channels shared by the tabs of one origin.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<SyncMessage>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for `name`, creating the channel on first use.
    pub fn channel(&self, name: &str) -> broadcast::Sender<SyncMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

pub struct ChannelBroadcaster {
    sender: broadcast::Sender<SyncMessage>,
}

impl ChannelBroadcaster {
    pub fn new(hub: &BroadcastHub, channel: &str) -> Self {
        Self {
            sender: hub.channel(channel),
        }
    }
}

impl SessionBroadcaster for ChannelBroadcaster {
    fn name(&self) -> &'static str {
        "broadcast-channel"
    }

    fn post(&self, message: &SyncMessage) -> Result<()> {
        // No other tab listening is not an error
        if self.sender.send(message.clone()).is_err() {
            debug!("No sync listeners");
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<SyncMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut source = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = source.recv() => received,
                };
                match received {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync listener lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

/// Signals through a sentinel key: writing it notifies every other handle
/// on the same storage.
pub struct StorageEventBroadcaster {
    storage: Arc<dyn ObservableStorage>,
    key: String,
}

impl StorageEventBroadcaster {
    pub fn new(storage: Arc<dyn ObservableStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }
}

impl SessionBroadcaster for StorageEventBroadcaster {
    fn name(&self) -> &'static str {
        "storage-event"
    }

    fn post(&self, message: &SyncMessage) -> Result<()> {
        let json = serde_json::to_string(message).context("Failed to encode sync message")?;
        self.storage
            .set(&self.key, &json)
            .context("Failed to write sync sentinel")?;
        // Removing right away lets an identical message fire again later
        self.storage
            .remove(&self.key)
            .context("Failed to clear sync sentinel")
    }

    fn subscribe(&self) -> mpsc::Receiver<SyncMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut changes = self.storage.watch();
        let key = self.key.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = changes.recv() => received,
                };
                let change = match received {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Storage listener lagged, changes dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if change.key != key {
                    continue;
                }
                let Some(raw) = change.new_value else {
                    continue;
                };
                match serde_json::from_str::<SyncMessage>(&raw) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed sync sentinel"),
                }
            }
        });
        rx
    }
}

/// Pick the best transport available: a broadcast channel if the
/// environment has one, else storage events, else none (single tab).
pub fn select_broadcaster(
    hub: Option<&BroadcastHub>,
    storage: Option<Arc<dyn ObservableStorage>>,
    config: &SessionConfig,
) -> Option<Arc<dyn SessionBroadcaster>> {
    let selected: Option<Arc<dyn SessionBroadcaster>> = match (hub, storage) {
        (Some(hub), _) => Some(Arc::new(ChannelBroadcaster::new(hub, &config.sync_channel))),
        (None, Some(storage)) => Some(Arc::new(StorageEventBroadcaster::new(
            storage,
            config.sync_storage_key.clone(),
        ))),
        (None, None) => None,
    };
    match &selected {
        Some(b) => debug!(broadcaster = b.name(), "Cross-tab sync transport selected"),
        None => debug!("No cross-tab sync transport available"),
    }
    selected
}
