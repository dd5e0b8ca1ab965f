//! Per-key circuit breaker.
//!
//! A key opens once `failure_threshold` consecutive failures have been
//! recorded and stays open for `reset_timeout_ms` after the last one. Calls
//! against an open key fail with [`ApiError::CircuitOpen`] without running
//! the operation. Once the timeout lapses the count is reset and a real
//! attempt goes through again.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::ApiError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open { retry_after: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    fn status_of(&self, state: &CircuitState, now: Instant) -> CircuitStatus {
        if state.failure_count < self.config.failure_threshold {
            return CircuitStatus::Closed;
        }
        match state.last_failure_at {
            Some(at) => {
                let elapsed = now.saturating_duration_since(at);
                if elapsed < self.reset_timeout() {
                    CircuitStatus::Open {
                        retry_after: self.reset_timeout() - elapsed,
                    }
                } else {
                    CircuitStatus::Closed
                }
            }
            None => CircuitStatus::Closed,
        }
    }

    /// Current derived status for `key`.
    pub async fn status(&self, key: &str) -> CircuitStatus {
        let states = self.states.lock().await;
        states
            .get(key)
            .map(|state| self.status_of(state, Instant::now()))
            .unwrap_or(CircuitStatus::Closed)
    }

    pub async fn state(&self, key: &str) -> CircuitState {
        self.states.lock().await.get(key).copied().unwrap_or_default()
    }

    /// Decide whether a call for `key` may proceed, resetting an expired
    /// open circuit so the next attempt is a real one.
    async fn admit(&self, key: &str) -> Result<(), ApiError> {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(key) else {
            return Ok(());
        };
        if state.failure_count < self.config.failure_threshold {
            return Ok(());
        }
        match self.status_of(state, Instant::now()) {
            CircuitStatus::Open { retry_after } => {
                debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, failing fast");
                Err(ApiError::CircuitOpen {
                    key: key.to_string(),
                    retry_after_ms: retry_after.as_millis() as u64,
                })
            }
            CircuitStatus::Closed => {
                info!(key, "Circuit reset timeout elapsed, allowing trial call");
                *state = CircuitState::default();
                Ok(())
            }
        }
    }

    pub async fn record_success(&self, key: &str) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(key) {
            if state.failure_count > 0 {
                debug!(key, "Circuit failure count reset after success");
            }
            *state = CircuitState::default();
        }
    }

    pub async fn record_failure(&self, key: &str) {
        let mut states = self.states.lock().await;
        let state = states.entry(key.to_string()).or_default();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(Instant::now());
        if state.failure_count == self.config.failure_threshold {
            warn!(
                key,
                failures = state.failure_count,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit opened"
            );
        }
    }

    /// Run `operation` under the circuit for `key`.
    pub async fn execute<T, F, Fut>(&self, key: &str, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.admit(key).await?;

        match operation().await {
            Ok(value) => {
                self.record_success(key).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(key).await;
                Err(e)
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
