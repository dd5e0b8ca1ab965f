//! Client-side session and request resilience.
//!
//! Keeps a user's authenticated session consistent across concurrent
//! requests and across tabs of one origin:
//! - every outgoing request runs through a middleware [`pipeline`]
//! - 401s trigger a single coalesced token refresh and one replay per request
//! - tokens are refreshed ahead of expiry
//! - session changes are broadcast to, and applied from, other tabs
//! - transient failures are retried with backoff behind per-key circuit breakers
//!
//! [`SessionRuntime`] wires all of it together for one tab.

pub mod api;
pub mod auth;
pub mod config;
pub mod pipeline;
pub mod resilience;
pub mod runtime;
pub mod storage;
pub mod sync;

pub use api::{ApiClient, ApiError};
pub use auth::{Credentials, RegisterData, Session, SessionStore, User};
pub use config::SessionConfig;
pub use runtime::{SessionRuntime, SessionRuntimeBuilder};
