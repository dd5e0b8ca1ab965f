//! Resilience primitives applied around network calls.
//!
//! - `RetryPolicy`: bounded attempts with exponential backoff and jitter
//! - `CircuitBreaker`: per-key fail-fast guard for a degraded downstream

pub mod circuit;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus};
pub use retry::{RetryConfig, RetryPolicy};
