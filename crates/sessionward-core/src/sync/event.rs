use std::fmt;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::auth::{TokenPair, User};

/// Identifies one tab (one `SessionStore`) among those sharing an origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TabId(String);

impl TabId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(format!("tab-{:012x}", rand::thread_rng().gen::<u64>() & 0xffff_ffff_ffff))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A session change announced to the other tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEvent {
    Login { user: User, tokens: TokenPair },
    Logout,
    TokenRefreshed { tokens: TokenPair },
    SessionExpired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Login { .. } => "LOGIN",
            SyncEvent::Logout => "LOGOUT",
            SyncEvent::TokenRefreshed { .. } => "TOKEN_REFRESHED",
            SyncEvent::SessionExpired { .. } => "SESSION_EXPIRED",
        }
    }
}

/// Envelope carried over the sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub source: TabId,
    /// Epoch milliseconds at send time.
    pub sent_at: i64,
    pub event: SyncEvent,
}

impl SyncMessage {
    pub fn new(source: TabId, event: SyncEvent) -> Self {
        Self {
            source,
            sent_at: Utc::now().timestamp_millis(),
            event,
        }
    }
}
