use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::broadcaster::SessionBroadcaster;
use super::event::{SyncEvent, SyncMessage, TabId};
use crate::auth::SessionStore;

/// Keeps the session of one tab in step with the other tabs of its origin.
pub struct CrossTabSync {
    tab_id: TabId,
    broadcaster: Arc<dyn SessionBroadcaster>,
}

impl CrossTabSync {
    pub fn new(tab_id: TabId, broadcaster: Arc<dyn SessionBroadcaster>) -> Self {
        Self { tab_id, broadcaster }
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Announce `event` to the other tabs.
    ///
    /// Delivery failures are logged and dropped; they never fail the action
    /// that produced the event.
    pub fn broadcast(&self, event: SyncEvent) {
        let kind = event.kind();
        let message = SyncMessage::new(self.tab_id.clone(), event);
        match self.broadcaster.post(&message) {
            Ok(()) => debug!(tab = %self.tab_id, event = kind, "Sync event broadcast"),
            Err(e) => warn!(
                tab = %self.tab_id,
                event = kind,
                transport = self.broadcaster.name(),
                error = %e,
                "Failed to broadcast sync event"
            ),
        }
    }

    /// Apply events from other tabs to `store` until the task is aborted.
    pub fn listen(&self, store: Arc<SessionStore>) -> JoinHandle<()> {
        let mut messages = self.broadcaster.subscribe();
        let own = self.tab_id.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if message.source == own {
                    continue;
                }
                debug!(tab = %own, from = %message.source, event = message.event.kind(), "Sync event received");
                store.apply_sync_event(message.event);
            }
            debug!(tab = %own, "Sync listener stopped");
        })
    }
}
