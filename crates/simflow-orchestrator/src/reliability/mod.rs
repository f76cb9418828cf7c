//! Reliability patterns for node execution
//!
//! This module provides:
//! - [`BackoffPolicy`] - Retry budget with capped exponential backoff
//! - [`CircuitBreakerConfig`] / [`CircuitBreakerState`] - Per-node circuit breaker

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{Admission, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use retry::BackoffPolicy;
