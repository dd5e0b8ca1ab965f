//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::ApiError;

/// Fraction of the computed delay used as the upper bound for jitter.
const JITTER_FRACTION: f64 = 0.1;

/// Exponent cap so `powi` cannot overflow into infinity.
const MAX_BACKOFF_EXPONENT: u32 = 31;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: Option<u64>,
    /// Add up to 10% of the delay as random extra wait.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: Some(10_000),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Backoff after the given failed attempt (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as i32;
        let multiplier = self.config.backoff_multiplier.max(1.0);
        let mut delay_ms = self.config.delay_ms as f64 * multiplier.powi(exponent);
        if let Some(max) = self.config.max_delay_ms {
            delay_ms = delay_ms.min(max as f64);
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// Backoff after the given failed attempt, including jitter if enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let extra_ms = base.as_millis() as f64 * JITTER_FRACTION;
        let jitter = rand::thread_rng().gen_range(0.0..=extra_ms);
        base + Duration::from_millis(jitter as u64)
    }

    /// Run `operation` retrying the failures `ApiError::is_retryable` accepts.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.execute_with(operation, ApiError::is_retryable).await
    }

    /// Run `operation` with a caller-supplied retryability predicate.
    ///
    /// The first attempt runs immediately. A failure on the last attempt, or
    /// one `should_retry` rejects, is returned as-is.
    pub async fn execute_with<T, E, F, Fut, P>(&self, mut operation: F, should_retry: P) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(attempt, error = %e, "Failure is not retryable");
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        warn!(attempt, max_attempts, error = %e, "Operation failed after all retry attempts");
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying operation after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
