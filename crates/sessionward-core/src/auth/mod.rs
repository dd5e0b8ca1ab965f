//! Authentication and session management.
//!
//! This module handles:
//! - Bearer tokens and expiry decoding
//! - The session store and its persistence
//! - Coalesced 401 recovery (`SessionRefreshCoordinator`, `SessionRefreshStage`)
//! - Refreshing ahead of expiry (`ProactiveRefreshScheduler`)

pub mod refresh;
pub mod scheduler;
pub mod session;
pub mod token;
pub mod types;

pub use refresh::{SessionRefreshCoordinator, SessionRefreshStage};
pub use scheduler::{compute_delay, ProactiveRefreshScheduler};
pub use session::{HeadlessNavigator, Navigator, Session, SessionStore, REFRESH_CIRCUIT_KEY};
pub use token::{encode_unsigned, AccessToken, RefreshToken, TokenPair, TokenSource};
pub use types::{AuthResponse, Credentials, RegisterData, User};
