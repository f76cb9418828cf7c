// Routing decisions

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use simflow_core::serde_helpers::option_duration_millis;

use crate::reliability::CircuitBreakerState;

/// Why a router chose its next nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Node succeeded
    Success,
    /// Node did not succeed and has no recovery path
    NotSuccessful,
    /// Retry the node after a delay
    Retry,
    /// Retry budget used up
    RetryExhausted,
    /// Error kind or severity forbids retries
    NonRetryable,
    /// Resource error rerouted to the fallback node
    ResourceFallback,
    /// Breaker closed, attempt admitted
    BreakerAdmitted,
    /// Breaker open, attempt rejected
    BreakerOpen,
    /// Breaker cool-down elapsed, probe admitted
    BreakerProbe,
    /// First matching conditional rule
    ConditionMatched,
    /// No conditional rule matched
    DefaultBranch,
    /// Capacity satisfies the requirement
    ResourcesAvailable,
    /// Capacity falls short of the requirement
    InsufficientResources,
    /// Best candidate by historical performance
    PerformanceSelected,
    /// No candidates to choose from
    NoCandidates,
    /// Start all branches
    FanOut,
    /// Some branches are still running
    JoinWaiting,
    /// A branch failed under a strict policy; unfinished siblings are cancelled
    JoinShortCircuit,
    /// All branches terminal and acceptable
    JoinComplete,
    /// All branches terminal, failure under a strict policy
    JoinFailed,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotSuccessful => "not_successful",
            Self::Retry => "retry",
            Self::RetryExhausted => "retry_exhausted",
            Self::NonRetryable => "non_retryable",
            Self::ResourceFallback => "resource_fallback",
            Self::BreakerAdmitted => "breaker_admitted",
            Self::BreakerOpen => "breaker_open",
            Self::BreakerProbe => "breaker_probe",
            Self::ConditionMatched => "condition_matched",
            Self::DefaultBranch => "default_branch",
            Self::ResourcesAvailable => "resources_available",
            Self::InsufficientResources => "insufficient_resources",
            Self::PerformanceSelected => "performance_selected",
            Self::NoCandidates => "no_candidates",
            Self::FanOut => "fan_out",
            Self::JoinWaiting => "join_waiting",
            Self::JoinShortCircuit => "join_short_circuit",
            Self::JoinComplete => "join_complete",
            Self::JoinFailed => "join_failed",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change implied by a decision
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateUpdate {
    IncrementRetry { node: String },
    ResetRetry { node: String },
    Breaker { node: String, state: CircuitBreakerState },
    /// Cancel the node's outstanding work
    Cancel { node: String },
}

/// Output of a router
///
/// Produced fresh for every decision and never modified afterwards; all
/// fields are read through accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    next: Vec<String>,
    reason: DecisionReason,
    #[serde(
        rename = "delay_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    delay: Option<Duration>,
    metadata: Map<String, Value>,
    updates: Vec<StateUpdate>,
}

impl RoutingDecision {
    pub(crate) fn to(next: impl Into<String>, reason: DecisionReason) -> Self {
        Self::to_all(vec![next.into()], reason)
    }

    pub(crate) fn to_all(next: Vec<String>, reason: DecisionReason) -> Self {
        Self {
            next,
            reason,
            delay: None,
            metadata: Map::new(),
            updates: Vec::new(),
        }
    }

    /// Decision that routes nowhere yet
    pub(crate) fn wait(reason: DecisionReason) -> Self {
        Self::to_all(Vec::new(), reason)
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn with_update(mut self, update: StateUpdate) -> Self {
        self.updates.push(update);
        self
    }

    pub fn next(&self) -> &[String] {
        &self.next
    }

    /// First next node, if any
    pub fn target(&self) -> Option<&str> {
        self.next.first().map(String::as_str)
    }

    pub fn reason(&self) -> DecisionReason {
        self.reason
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn updates(&self) -> &[StateUpdate] {
        &self.updates
    }

    /// Whether the decision holds the workflow in place
    pub fn is_wait(&self) -> bool {
        self.next.is_empty()
    }

    /// Nodes whose outstanding work must be cancelled
    pub fn cancellations(&self) -> impl Iterator<Item = &str> {
        self.updates.iter().filter_map(|u| match u {
            StateUpdate::Cancel { node } => Some(node.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_accessors() {
        let decision = RoutingDecision::to("execute:cfd", DecisionReason::Retry)
            .with_delay(Duration::from_millis(400))
            .with_meta("attempt", 2)
            .with_update(StateUpdate::IncrementRetry {
                node: "execute:cfd".into(),
            });

        assert_eq!(decision.target(), Some("execute:cfd"));
        assert_eq!(decision.delay(), Some(Duration::from_millis(400)));
        assert_eq!(decision.metadata()["attempt"], 2);
        assert_eq!(decision.updates().len(), 1);
        assert!(!decision.is_wait());
    }

    #[test]
    fn test_wait_and_cancellations() {
        let decision = RoutingDecision::wait(DecisionReason::JoinShortCircuit)
            .with_update(StateUpdate::Cancel { node: "a".into() })
            .with_update(StateUpdate::Cancel { node: "b".into() });
        assert!(decision.is_wait());
        assert_eq!(decision.cancellations().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_serialized_shape() {
        let decision = RoutingDecision::to("join", DecisionReason::RetryExhausted);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["reason"], "retry_exhausted");
        assert_eq!(json["next"][0], "join");
        assert!(json.get("delay_ms").is_none());
    }
}
