//! Application-facing API client.
//!
//! Requests go through the full middleware pipeline, so they carry the
//! current bearer token and recover from 401s transparently. `call` adds a
//! per-key circuit breaker and retry policy on top for endpoints that should
//! back off when the server is struggling.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::ApiError;
use crate::pipeline::{Pipeline, RequestContext, ResponseContext};
use crate::resilience::{CircuitBreaker, RetryPolicy};

pub struct ApiClient {
    pipeline: Arc<Pipeline>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(pipeline: Arc<Pipeline>, breaker: CircuitBreaker, retry: RetryPolicy) -> Self {
        Self {
            pipeline,
            breaker,
            retry,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Send a request once through the pipeline.
    pub async fn send(&self, request: RequestContext) -> Result<ResponseContext, ApiError> {
        self.pipeline.send(request).await
    }

    /// Send a request under the circuit for `key`, retrying transient failures.
    ///
    /// Retries happen inside the circuit: an exhausted retry run counts as
    /// one failure for the key.
    pub async fn call(&self, key: &str, request: RequestContext) -> Result<ResponseContext, ApiError> {
        debug!(key, request = %request.execution_key(), "Calling through circuit");
        let request = &request;
        let pipeline = &self.pipeline;
        let retry = &self.retry;
        self.breaker
            .execute(key, move || {
                retry.execute(move || {
                    let request = request.clone();
                    async move { pipeline.send(request).await }
                })
            })
            .await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(RequestContext::get(path)).await?.json()
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        self.send(RequestContext::post(path, body)).await?.json()
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        self.send(RequestContext::put(path, body)).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(RequestContext::delete(path)).await?;
        Ok(())
    }
}
