//! Middleware pipeline wrapping every outgoing request.
//!
//! This module provides:
//! - `Pipeline`: the phase-based executor (REQUEST → transport → RESPONSE, ERROR on failure)
//! - `Stage` / `Next`: the chain-of-responsibility contract stages implement
//! - Context types threaded through one execution
//! - Stock stages for shaping, auth headers, status checks and logging
//!
//! The 401-driven refresh stage lives with the session code in `auth::refresh`.

pub mod context;
pub mod executor;
pub mod stages;

pub use context::{Metadata, MiddlewareContext, RequestContext, ResponseContext};
pub use executor::{ExecutionStats, Next, Phase, Pipeline, Stage};
pub use stages::{AuthHeaderStage, LoggingStage, RequestShapingStage, StatusCheckStage};
