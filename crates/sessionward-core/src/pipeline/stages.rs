//! Stock pipeline stages.
//!
//! - `RequestShapingStage`: base URL, JSON headers, request id (REQUEST)
//! - `AuthHeaderStage`: bearer token injection (REQUEST)
//! - `StatusCheckStage`: non-2xx responses become `ApiError`s (RESPONSE)
//! - `LoggingStage`: timing and outcome logging (any phase)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use super::context::MiddlewareContext;
use super::executor::{Next, Stage};
use crate::api::ApiError;
use crate::auth::TokenSource;

/// Metadata key holding the request start time in epoch milliseconds.
const STARTED_AT_KEY: &str = "sessionward.started_at_ms";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Logs each phase it is registered in.
///
/// Register the same instance under all three phases; it tells them apart by
/// the state of the context it receives.
#[derive(Debug, Default)]
pub struct LoggingStage;

impl LoggingStage {
    fn elapsed_ms(ctx: &MiddlewareContext) -> Option<i64> {
        ctx.metadata
            .get(STARTED_AT_KEY)
            .and_then(|v| v.as_i64())
            .map(|started| Utc::now().timestamp_millis() - started)
    }
}

#[async_trait]
impl Stage for LoggingStage {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, mut ctx: MiddlewareContext, next: Next<'_>) -> MiddlewareContext {
        let method = ctx.request.method.clone();
        let url = ctx.request.url.clone();

        if let Some(ref error) = ctx.error {
            let status = ctx.response.as_ref().map(|r| r.status);
            warn!(
                method = %method,
                url = %url,
                status = ?status,
                elapsed_ms = ?Self::elapsed_ms(&ctx),
                retry = ctx.request.is_auth_retry(),
                error = %error,
                "Request failed"
            );
        } else if let Some(ref response) = ctx.response {
            debug!(
                method = %method,
                url = %url,
                status = response.status,
                elapsed_ms = ?Self::elapsed_ms(&ctx),
                "Response received"
            );
        } else {
            ctx.metadata
                .insert(STARTED_AT_KEY.to_string(), json!(Utc::now().timestamp_millis()));
            debug!(method = %method, url = %url, retry = ctx.request.is_auth_retry(), "Sending request");
        }

        next.run(ctx).await
    }
}

/// Resolves relative URLs against a base and applies JSON defaults.
#[derive(Debug, Clone)]
pub struct RequestShapingStage {
    base_url: String,
}

impl RequestShapingStage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") || self.base_url.is_empty() {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn request_id() -> String {
        format!("{:016x}", rand::thread_rng().gen::<u64>())
    }
}

#[async_trait]
impl Stage for RequestShapingStage {
    fn name(&self) -> &str {
        "request-shaping"
    }

    async fn handle(&self, mut ctx: MiddlewareContext, next: Next<'_>) -> MiddlewareContext {
        let request = &mut ctx.request;
        request.url = self.resolve(&request.url);

        if request.header("accept").is_none() {
            request.set_header("accept", "application/json");
        }
        if request.body.is_some() && request.header("content-type").is_none() {
            request.set_header("content-type", "application/json");
        }
        if request.header(REQUEST_ID_HEADER).is_none() {
            request.set_header(REQUEST_ID_HEADER, Self::request_id());
        }

        next.run(ctx).await
    }
}

/// Attaches `Authorization: Bearer <token>` from a token source.
///
/// Always overwrites an existing header so that replayed requests carry the
/// token current at replay time.
pub struct AuthHeaderStage {
    source: Arc<dyn TokenSource>,
}

impl AuthHeaderStage {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Stage for AuthHeaderStage {
    fn name(&self) -> &str {
        "auth-header"
    }

    async fn handle(&self, mut ctx: MiddlewareContext, next: Next<'_>) -> MiddlewareContext {
        if !ctx.request.skips_auth() {
            if let Some(token) = self.source.access_token() {
                ctx.request
                    .set_header("authorization", format!("Bearer {}", token.as_str()));
            }
        }
        next.run(ctx).await
    }
}

/// Converts non-success responses into errors, keeping the response
/// attached so error stages can inspect the status.
#[derive(Debug, Default)]
pub struct StatusCheckStage;

#[async_trait]
impl Stage for StatusCheckStage {
    fn name(&self) -> &str {
        "status-check"
    }

    async fn handle(&self, mut ctx: MiddlewareContext, next: Next<'_>) -> MiddlewareContext {
        if let Some(ref response) = ctx.response {
            if !response.is_success() {
                ctx.error = Some(ApiError::from_status(response.status, &response.body_text()));
            }
        }
        next.run(ctx).await
    }
}
