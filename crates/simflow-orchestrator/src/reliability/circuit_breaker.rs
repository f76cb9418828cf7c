//! Per-node circuit breaker
//!
//! The breaker is a value held in the workflow's execution state. Routers
//! compute the next breaker value; only the controller stores it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simflow_core::serde_helpers::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all attempts allowed
    #[default]
    Closed,

    /// Failure threshold reached - all attempts rejected
    Open,

    /// Cool-down elapsed - exactly one probe allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐    cool-down    ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲       probe failed        │
///      │                               └───────────────────────────┤
///      │                 probe succeeded                           │
///      └───────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before allowing a probe
    #[serde(with = "duration_millis")]
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }
}

/// Result of asking the breaker whether an attempt may start
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Breaker closed
    Allowed,
    /// Cool-down elapsed; the attempt is the single probe and the breaker
    /// moves to the contained half-open state
    Probe(CircuitBreakerState),
    /// Breaker open (or a probe is already in flight)
    Rejected,
}

/// Breaker value for one node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Whether the open period has lasted at least `cool_down`
    pub fn cool_down_elapsed(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(opened_at) => now
                .signed_duration_since(opened_at)
                .to_std()
                .map(|elapsed| elapsed >= config.cool_down)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Gate check evaluated before every attempt
    pub fn admit(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open if self.cool_down_elapsed(config, now) => {
                Admission::Probe(Self {
                    state: CircuitState::HalfOpen,
                    consecutive_failures: self.consecutive_failures,
                    opened_at: self.opened_at,
                })
            }
            CircuitState::Open | CircuitState::HalfOpen => Admission::Rejected,
        }
    }

    /// Breaker value after a successful attempt
    pub fn on_success(&self) -> Self {
        Self::closed()
    }

    /// Breaker value after an admitted attempt was cancelled before it finished
    ///
    /// A half-open breaker goes back to open with its original open time, so
    /// the next attempt is admitted once the cool-down has elapsed again.
    pub fn on_abandoned(&self) -> Self {
        match self.state {
            CircuitState::HalfOpen => Self {
                state: CircuitState::Open,
                consecutive_failures: self.consecutive_failures,
                opened_at: self.opened_at,
            },
            CircuitState::Closed | CircuitState::Open => self.clone(),
        }
    }

    /// Breaker value after a failed attempt
    pub fn on_failure(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Self {
        let consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => Self {
                state: CircuitState::Open,
                consecutive_failures,
                opened_at: Some(now),
            },
            CircuitState::Open => Self {
                state: CircuitState::Open,
                consecutive_failures,
                opened_at: self.opened_at.or(Some(now)),
            },
            CircuitState::Closed if consecutive_failures >= config.failure_threshold => Self {
                state: CircuitState::Open,
                consecutive_failures,
                opened_at: Some(now),
            },
            CircuitState::Closed => Self {
                state: CircuitState::Closed,
                consecutive_failures,
                opened_at: None,
            },
        }
    }
}
