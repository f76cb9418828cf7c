// Historical execution metrics
//
// Decision: Process-wide history is an injected Arc<MetricsStore>, not a
// global. Each record() runs under one write lock so readers never see a
// count updated without its mean.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use simflow_core::serde_helpers::duration_millis;

/// Outcome history of one node or performer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    /// Mean duration over all recorded outcomes
    #[serde(with = "duration_millis")]
    pub mean_duration: Duration,
}

impl ExecutionMetrics {
    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Failure rate in `[0, 1]`; zero without history
    pub fn failure_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failure_count as f64 / total as f64,
        }
    }

    /// Record one terminal outcome
    pub fn record(&mut self, success: bool, duration: Duration) {
        let previous = self.total() as u128;
        let mean = self.mean_duration.as_nanos();
        let updated = (mean * previous + duration.as_nanos()) / (previous + 1);
        self.mean_duration = Duration::from_nanos(u64::try_from(updated).unwrap_or(u64::MAX));
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }

    /// Compare failure rates exactly: `a.failures/a.total` vs `b.failures/b.total`
    pub(crate) fn cmp_failure_rate(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = self.failure_count as u128 * other.total().max(1) as u128;
        let rhs = other.failure_count as u128 * self.total().max(1) as u128;
        lhs.cmp(&rhs)
    }
}

/// Shared metrics keyed by node or performer name
#[derive(Debug, Default)]
pub struct MetricsStore {
    inner: RwLock<HashMap<String, ExecutionMetrics>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal outcome for `node`
    pub fn record(&self, node: &str, success: bool, duration: Duration) {
        let mut inner = self.inner.write();
        inner
            .entry(node.to_string())
            .or_default()
            .record(success, duration);
    }

    /// Metrics for `node`; `None` without history
    pub fn get(&self, node: &str) -> Option<ExecutionMetrics> {
        self.inner.read().get(node).copied()
    }

    /// Metrics for `node`, zeroed without history
    pub fn get_or_default(&self, node: &str) -> ExecutionMetrics {
        self.get(node).unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<String, ExecutionMetrics> {
        self.inner.read().clone()
    }

    /// Seed metrics, replacing existing history for `node`
    pub fn insert(&self, node: impl Into<String>, metrics: ExecutionMetrics) {
        self.inner.write().insert(node.into(), metrics);
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}
