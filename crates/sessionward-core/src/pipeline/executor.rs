//! Phase-based chain-of-responsibility executor.
//!
//! Stages are registered under a [`Phase`] and run in registration order
//! within it. An execution runs the REQUEST chain, calls the transport unless
//! a stage already produced a response, then runs the RESPONSE chain, or the
//! ERROR chain if anything along the way raised an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::context::{MiddlewareContext, RequestContext, ResponseContext};
use crate::api::{ApiError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Request,
    Response,
    Error,
}

/// One link in a phase chain.
///
/// A stage calls `next.run(ctx)` to continue the chain, or returns its
/// context directly to stop it.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: MiddlewareContext, next: Next<'_>) -> MiddlewareContext;
}

/// The remainder of a phase chain.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Stage>],
    pipeline: &'a Pipeline,
}

impl<'a> Next<'a> {
    fn new(stages: &'a [Arc<dyn Stage>], pipeline: &'a Pipeline) -> Self {
        Self {
            remaining: stages,
            pipeline,
        }
    }

    pub async fn run(self, ctx: MiddlewareContext) -> MiddlewareContext {
        match self.remaining.split_first() {
            Some((stage, rest)) => {
                let next = Next::new(rest, self.pipeline);
                stage.handle(ctx, next).await
            }
            None => ctx,
        }
    }

    /// Run `request` through the whole pipeline again, all phases included.
    pub async fn replay(&self, request: RequestContext) -> MiddlewareContext {
        self.pipeline.execute(request).await
    }
}

/// Diagnostic counters per execution key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_time: Duration,
}

pub struct Pipeline {
    transport: Arc<dyn Transport>,
    request_stages: Vec<Arc<dyn Stage>>,
    response_stages: Vec<Arc<dyn Stage>>,
    error_stages: Vec<Arc<dyn Stage>>,
    default_timeout: Option<Duration>,
    metrics: Mutex<HashMap<String, ExecutionStats>>,
}

impl Pipeline {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            request_stages: Vec::new(),
            response_stages: Vec::new(),
            error_stages: Vec::new(),
            default_timeout: None,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Abort transport calls that take longer than `timeout` unless the
    /// request carries its own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn add_stage(&mut self, stage: Arc<dyn Stage>, phase: Phase) -> &mut Self {
        match phase {
            Phase::Request => self.request_stages.push(stage),
            Phase::Response => self.response_stages.push(stage),
            Phase::Error => self.error_stages.push(stage),
        }
        self
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>, phase: Phase) -> Self {
        self.add_stage(stage, phase);
        self
    }

    pub fn stage_names(&self, phase: Phase) -> Vec<&str> {
        let stages = match phase {
            Phase::Request => &self.request_stages,
            Phase::Response => &self.response_stages,
            Phase::Error => &self.error_stages,
        };
        stages.iter().map(|s| s.name()).collect()
    }

    /// Run one request through all phases.
    ///
    /// Boxed because stages may re-enter the pipeline through `Next::replay`.
    pub fn execute(&self, request: RequestContext) -> BoxFuture<'_, MiddlewareContext> {
        async move {
            let started = Instant::now();
            let key = request.execution_key();

            let mut ctx = Next::new(&self.request_stages, self)
                .run(MiddlewareContext::new(request))
                .await;

            if ctx.error.is_none() && ctx.response.is_none() {
                ctx = self.dispatch(ctx).await;
            } else if ctx.response.is_some() {
                debug!(key = %key, "Request short-circuited by a stage");
            }

            if ctx.error.is_none() && ctx.response.is_some() {
                ctx = Next::new(&self.response_stages, self).run(ctx).await;
            }

            if ctx.error.is_some() {
                ctx = Next::new(&self.error_stages, self).run(ctx).await;
            }

            self.record(key, started.elapsed(), !ctx.has_error()).await;
            ctx
        }
        .boxed()
    }

    /// Execute and collapse the outcome into a `Result`.
    pub async fn send(&self, request: RequestContext) -> Result<ResponseContext, ApiError> {
        self.execute(request).await.into_result()
    }

    async fn dispatch(&self, ctx: MiddlewareContext) -> MiddlewareContext {
        let limit = ctx.request.timeout.or(self.default_timeout);
        let call = self.transport.send(&ctx.request);
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(ApiError::Timeout)),
            None => call.await,
        };

        match result {
            Ok(response) => ctx.with_response(response),
            Err(e) => ctx.with_error(e),
        }
    }

    async fn record(&self, key: String, elapsed: Duration, success: bool) {
        let mut metrics = self.metrics.lock().await;
        let stats = metrics.entry(key).or_default();
        stats.count += 1;
        stats.total_time += elapsed;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
    }

    pub async fn metrics(&self) -> HashMap<String, ExecutionStats> {
        self.metrics.lock().await.clone()
    }
}
