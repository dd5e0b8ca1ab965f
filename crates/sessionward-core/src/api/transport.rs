//! The network edge of the pipeline.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::ApiError;
use crate::pipeline::{RequestContext, ResponseContext};

/// Performs the actual network call for a fully shaped request.
///
/// Non-2xx statuses are returned as responses, not errors; only failures to
/// obtain a response at all (timeouts, connection errors) are `Err`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestContext) -> Result<ResponseContext, ApiError>;
}

/// HTTP transport over a shared reqwest client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestContext) -> Result<ResponseContext, ApiError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let text = response.text().await?;
        let data = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        debug!(url = %request.url, status, "Transport response received");

        Ok(ResponseContext {
            status,
            headers,
            data,
            metadata: Default::default(),
        })
    }
}
