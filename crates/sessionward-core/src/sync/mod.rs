//! Cross-tab session synchronization.
//!
//! Tabs of one origin share storage but not memory. Each announces its
//! session changes (login, logout, refresh, expiry) over a broadcaster and
//! applies what the others announce, without echoing it back.

pub mod broadcaster;
pub mod cross_tab;
pub mod event;

pub use broadcaster::{
    select_broadcaster, BroadcastHub, ChannelBroadcaster, SessionBroadcaster, StorageEventBroadcaster,
};
pub use cross_tab::CrossTabSync;
pub use event::{SyncEvent, SyncMessage, TabId};
