//! HTTP-facing pieces of the session layer.
//!
//! This module provides the `ApiClient` applications send requests through,
//! the `AuthService` the session store talks to, the `Transport` seam the
//! pipeline dispatches on, and the `ApiError` taxonomy shared by all of them.

pub mod auth_service;
pub mod client;
pub mod error;
pub mod transport;

pub use auth_service::{AuthService, HttpAuthService};
pub use client::ApiClient;
pub use error::ApiError;
pub use transport::{ReqwestTransport, Transport};
