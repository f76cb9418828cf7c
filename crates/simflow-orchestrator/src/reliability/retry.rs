//! Retry budget and exponential backoff

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use simflow_core::serde_helpers::duration_millis;

/// Retry budget for a single node
///
/// The delay before retry `n` (0-based, i.e. the node's retry count before the
/// increment) is `min(base_delay * 2^n, max_delay)`.
///
/// # Example
///
/// ```
/// use simflow_orchestrator::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::default()
///     .with_max_retries(4)
///     .with_base_delay(Duration::from_millis(500))
///     .with_max_delay(Duration::from_secs(4));
///
/// assert_eq!(policy.delay_for_retry(0), Duration::from_millis(500));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_retry(10), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Retries allowed per node (attempts = max_retries + 1)
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter factor (0.0-1.0) applied by the controller when sleeping.
    ///
    /// Routing decisions always carry the exact delay.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    /// - 3 retries
    /// - 1 second base delay
    /// - 60 second max delay
    /// - no jitter
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether a node that already retried `retry_count` times may retry again
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Exact delay before retry number `retry_count` (0-based)
    ///
    /// Computed in integer nanoseconds so the sequence is exact and
    /// monotonically non-decreasing up to `max_delay`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_nanos();
        let max = self.max_delay.as_nanos();
        let factor = 1u128.checked_shl(retry_count).unwrap_or(u128::MAX);
        let capped = base.saturating_mul(factor).min(max);
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Apply the configured jitter to a delay, never exceeding `max_delay`
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let secs = (delay.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = BackoffPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped_and_monotonic() {
        let policy = BackoffPolicy::default()
            .with_base_delay(Duration::from_millis(300))
            .with_max_delay(Duration::from_secs(5));

        let delays: Vec<_> = (0..200).map(|n| policy.delay_for_retry(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(5)));
        assert_eq!(delays[199], Duration::from_secs(5));
    }

    #[test]
    fn test_retry_budget() {
        let policy = BackoffPolicy::default().with_max_retries(2);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
        assert!(!BackoffPolicy::no_retry().allows_retry(0));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = BackoffPolicy::default()
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.2);
        for _ in 0..100 {
            let delay = policy.jittered(Duration::from_secs(1));
            assert!(delay >= Duration::from_millis(799));
            assert!(delay <= Duration::from_millis(1201));
        }
    }

    #[test]
    fn test_serialization_uses_millis() {
        let policy = BackoffPolicy::default().with_base_delay(Duration::from_millis(250));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["base_delay"], 250);

        let parsed: BackoffPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);
    }
}
