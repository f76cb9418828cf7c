//! Workflow router
//!
//! Stateless decision functions. Every method reads its inputs and returns a
//! fresh [`RoutingDecision`]; state changes travel in `decision.updates()`.

use chrono::{DateTime, Utc};
use serde_json::json;
use simflow_core::{ErrorKind, NodeError, Severity};

use super::branch::BranchRule;
use super::decision::{DecisionReason, RoutingDecision, StateUpdate};
use super::metrics::MetricsStore;
use super::resources::{CapacityProvider, ResourceRequirement};
use super::state::{ExecutionState, NodeStatus};
use crate::pipeline::FailurePolicy;
use crate::reliability::{Admission, BackoffPolicy, CircuitBreakerConfig, CircuitState};

/// Decision functions for workflow control flow
#[derive(Debug, Clone, Default)]
pub struct WorkflowRouter {
    backoff: BackoffPolicy,
    breaker: CircuitBreakerConfig,
}

impl WorkflowRouter {
    pub fn new(backoff: BackoffPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self { backoff, breaker }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn breaker_config(&self) -> &CircuitBreakerConfig {
        &self.breaker
    }

    /// Route a finished node to `success_node` or `error_node`
    ///
    /// Holds in place while the node is not terminal.
    pub fn success_path(
        &self,
        state: &ExecutionState,
        node: &str,
        success_node: &str,
        error_node: &str,
    ) -> RoutingDecision {
        match state.status(node) {
            NodeStatus::Success => RoutingDecision::to(success_node, DecisionReason::Success),
            status if status.is_terminal() => {
                RoutingDecision::to(error_node, DecisionReason::NotSuccessful)
                    .with_meta("status", status.to_string())
            }
            _ => RoutingDecision::wait(DecisionReason::JoinWaiting).with_meta("node", node),
        }
    }

    /// Decide whether a failed node is retried
    ///
    /// - `Resource` errors go to `fallback_node` when one is configured
    /// - retryable kinds below `Critical` severity retry while budget remains,
    ///   after `min(base * 2^retry_count, max_delay)`
    /// - everything else goes to `error_node`
    pub fn retry(
        &self,
        state: &ExecutionState,
        node: &str,
        error_node: &str,
        fallback_node: Option<&str>,
    ) -> RoutingDecision {
        let error = state
            .error_of(node)
            .cloned()
            .unwrap_or_else(|| NodeError::execution(format!("node {node} failed without an error")));
        let severity = error.severity();

        if error.kind == ErrorKind::Resource {
            if let Some(fallback) = fallback_node {
                return RoutingDecision::to(fallback, DecisionReason::ResourceFallback)
                    .with_meta("error_kind", error.kind.as_str());
            }
        }

        if !error.is_retryable() || severity >= Severity::Critical {
            return RoutingDecision::to(error_node, DecisionReason::NonRetryable)
                .with_meta("error_kind", error.kind.as_str())
                .with_meta("severity", severity.to_string());
        }

        let retry_count = state.retry_count(node);
        if !self.backoff.allows_retry(retry_count) {
            return RoutingDecision::to(error_node, DecisionReason::RetryExhausted)
                .with_meta("retries", retry_count)
                .with_meta("max_retries", self.backoff.max_retries);
        }

        let delay = self.backoff.delay_for_retry(retry_count);
        RoutingDecision::to(node, DecisionReason::Retry)
            .with_delay(delay)
            .with_meta("attempt", retry_count + 1)
            .with_meta("error_kind", error.kind.as_str())
            .with_meta("severity", severity.to_string())
            .with_update(StateUpdate::IncrementRetry {
                node: node.to_string(),
            })
    }

    /// Breaker check evaluated before every attempt on `node`
    pub fn breaker_gate(
        &self,
        state: &ExecutionState,
        node: &str,
        error_node: &str,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        let breaker = state.breaker(node);
        match breaker.admit(&self.breaker, now) {
            Admission::Allowed => RoutingDecision::to(node, DecisionReason::BreakerAdmitted),
            Admission::Probe(half_open) => RoutingDecision::to(node, DecisionReason::BreakerProbe)
                .with_update(StateUpdate::Breaker {
                    node: node.to_string(),
                    state: half_open,
                }),
            Admission::Rejected => RoutingDecision::to(error_node, DecisionReason::BreakerOpen)
                .with_meta("breaker", breaker.state.to_string())
                .with_meta("consecutive_failures", breaker.consecutive_failures),
        }
    }

    /// Breaker update for an attempt on `node` that was cancelled mid-flight
    ///
    /// Returns `None` unless the attempt ran half-open; in that case the
    /// breaker reopens and the node goes to `error_node`.
    pub fn release_breaker(
        &self,
        state: &ExecutionState,
        node: &str,
        error_node: &str,
    ) -> Option<RoutingDecision> {
        let breaker = state.breaker(node);
        if breaker.state != CircuitState::HalfOpen {
            return None;
        }
        Some(
            RoutingDecision::to(error_node, DecisionReason::BreakerOpen)
                .with_update(StateUpdate::Breaker {
                    node: node.to_string(),
                    state: breaker.on_abandoned(),
                })
                .with_meta("cancelled", true),
        )
    }

    /// Route a finished attempt through the node's circuit breaker
    ///
    /// Success closes the breaker and goes to `success_node`. A failure that
    /// opens (or reopens) the breaker goes to `error_node` regardless of the
    /// retry budget; other failures defer to [`WorkflowRouter::retry`].
    pub fn circuit_breaker(
        &self,
        state: &ExecutionState,
        node: &str,
        success_node: &str,
        error_node: &str,
        fallback_node: Option<&str>,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        let breaker = state.breaker(node);
        let status = state.status(node);

        if status == NodeStatus::Success {
            let decision = RoutingDecision::to(success_node, DecisionReason::Success);
            let closed = breaker.on_success();
            return if closed != breaker {
                decision.with_update(StateUpdate::Breaker {
                    node: node.to_string(),
                    state: closed,
                })
            } else {
                decision
            };
        }

        if !status.is_terminal() {
            return RoutingDecision::wait(DecisionReason::JoinWaiting).with_meta("node", node);
        }

        let next = breaker.on_failure(&self.breaker, now);
        let update = StateUpdate::Breaker {
            node: node.to_string(),
            state: next.clone(),
        };
        if next.is_open() {
            return RoutingDecision::to(error_node, DecisionReason::BreakerOpen)
                .with_meta("consecutive_failures", next.consecutive_failures)
                .with_update(update);
        }
        self.retry(state, node, error_node, fallback_node)
            .with_update(update)
    }

    /// First rule whose predicate matches its context key, else `default_node`
    pub fn conditional(
        &self,
        state: &ExecutionState,
        rules: &[BranchRule],
        default_node: &str,
    ) -> RoutingDecision {
        rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.predicate.matches(state.context_value(&rule.key)))
            .map(|(index, rule)| {
                RoutingDecision::to(&rule.target, DecisionReason::ConditionMatched)
                    .with_meta("rule", index)
                    .with_meta("key", rule.key.as_str())
            })
            .unwrap_or_else(|| RoutingDecision::to(default_node, DecisionReason::DefaultBranch))
    }

    /// Primary node if capacity covers the requirement, else `fallback_node`
    pub fn resource_aware(
        &self,
        requirement: &ResourceRequirement,
        capacity: &dyn CapacityProvider,
        primary_node: &str,
        fallback_node: &str,
    ) -> RoutingDecision {
        let snapshot = capacity.snapshot();
        let shortfalls = snapshot.shortfalls(requirement);
        let decision = if shortfalls.is_empty() {
            RoutingDecision::to(primary_node, DecisionReason::ResourcesAvailable)
        } else {
            RoutingDecision::to(fallback_node, DecisionReason::InsufficientResources)
                .with_meta("shortfalls", shortfalls)
        };
        decision
            .with_meta("required", json!(requirement))
            .with_meta("available", json!(snapshot))
    }

    /// Candidate with the lowest failure rate, then the lowest mean duration,
    /// then the earliest declaration
    ///
    /// Candidates without history count as failure rate 0 and duration 0.
    pub fn select_by_performance<S: AsRef<str>>(
        &self,
        candidates: &[S],
        metrics: &MetricsStore,
    ) -> RoutingDecision {
        let scored: Vec<_> = candidates
            .iter()
            .map(|c| (c.as_ref(), metrics.get_or_default(c.as_ref())))
            .collect();

        // min_by keeps the first of equal elements, preserving declaration order
        let best = scored.iter().min_by(|(_, a), (_, b)| {
            a.cmp_failure_rate(b)
                .then_with(|| a.mean_duration.cmp(&b.mean_duration))
        });

        match best {
            Some((name, stats)) => RoutingDecision::to(*name, DecisionReason::PerformanceSelected)
                .with_meta("failure_rate", stats.failure_rate())
                .with_meta("mean_duration_ms", stats.mean_duration.as_millis() as u64)
                .with_meta("samples", stats.total()),
            None => RoutingDecision::wait(DecisionReason::NoCandidates),
        }
    }

    /// Start every branch
    pub fn fan_out<S: AsRef<str>>(&self, branches: &[S]) -> RoutingDecision {
        RoutingDecision::to_all(
            branches.iter().map(|b| b.as_ref().to_string()).collect(),
            DecisionReason::FanOut,
        )
        .with_meta("branches", branches.len())
    }

    /// Barrier over `branches`
    ///
    /// Never proceeds while a branch is non-terminal. Under `Strict`, an
    /// observed failure short-circuits: unfinished siblings are marked for
    /// cancellation and the join keeps waiting until they are terminal.
    pub fn join<S: AsRef<str>>(
        &self,
        state: &ExecutionState,
        branches: &[S],
        policy: FailurePolicy,
        success_node: &str,
        error_node: &str,
    ) -> RoutingDecision {
        let mut pending = Vec::new();
        let mut failed = Vec::new();
        for branch in branches {
            let branch = branch.as_ref();
            let status = state.status(branch);
            if !status.is_terminal() {
                pending.push(branch.to_string());
            } else if status.is_failure() {
                failed.push(branch.to_string());
            }
        }

        let strict_failure = policy == FailurePolicy::Strict && !failed.is_empty();

        if !pending.is_empty() {
            if strict_failure {
                let mut decision = RoutingDecision::wait(DecisionReason::JoinShortCircuit)
                    .with_meta("failed", failed)
                    .with_meta("error_node", error_node);
                for node in pending {
                    decision = decision.with_update(StateUpdate::Cancel { node });
                }
                return decision;
            }
            return RoutingDecision::wait(DecisionReason::JoinWaiting).with_meta("pending", pending);
        }

        if strict_failure {
            RoutingDecision::to(error_node, DecisionReason::JoinFailed).with_meta("failed", failed)
        } else {
            RoutingDecision::to(success_node, DecisionReason::JoinComplete)
                .with_meta("failed", failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::{CircuitBreakerState, CircuitState};
    use crate::routing::branch::Predicate;
    use crate::routing::metrics::ExecutionMetrics;
    use crate::routing::resources::{ResourceSnapshot, StaticCapacity};
    use crate::routing::state::NodeResult;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    const NODE: &str = "execute:cfd";

    fn router() -> WorkflowRouter {
        WorkflowRouter::new(
            BackoffPolicy::default()
                .with_max_retries(3)
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(350)),
            CircuitBreakerConfig::new()
                .with_failure_threshold(2)
                .with_cool_down(Duration::from_secs(30)),
        )
    }

    fn failed_state(error: NodeError) -> ExecutionState {
        let mut state = ExecutionState::new(Uuid::now_v7());
        state.set_status(NODE, NodeStatus::Failure);
        state.record_result(
            NODE,
            NodeResult {
                error: Some(error),
                ..Default::default()
            },
        );
        state
    }

    #[test]
    fn test_success_path() {
        let router = router();
        let mut state = ExecutionState::new(Uuid::now_v7());

        assert!(router.success_path(&state, NODE, "join", "error").is_wait());

        state.set_status(NODE, NodeStatus::Success);
        let decision = router.success_path(&state, NODE, "join", "error");
        assert_eq!(decision.next(), ["join"]);
        assert_eq!(decision.reason(), DecisionReason::Success);

        state.set_status("other", NodeStatus::Cancelled);
        let decision = router.success_path(&state, "other", "join", "error");
        assert_eq!(decision.target(), Some("error"));
    }

    #[test]
    fn test_retry_sequence_is_exponential_then_exhausted() {
        let router = router();
        let mut state = failed_state(NodeError::execution("solver diverged"));
        let mut delays = Vec::new();

        loop {
            let decision = router.retry(&state, NODE, "error", None);
            if decision.reason() != DecisionReason::Retry {
                assert_eq!(decision.reason(), DecisionReason::RetryExhausted);
                assert_eq!(decision.target(), Some("error"));
                break;
            }
            assert_eq!(decision.target(), Some(NODE));
            delays.push(decision.delay().unwrap());
            state.apply(&decision);
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
            ]
        );
        assert_eq!(state.retry_count(NODE), 3);
    }

    #[test]
    fn test_router_never_mutates_state() {
        let router = router();
        let state = failed_state(NodeError::timeout("slow"));
        let before = state.retry_count(NODE);
        let decision = router.retry(&state, NODE, "error", None);
        assert_eq!(decision.reason(), DecisionReason::Retry);
        assert_eq!(state.retry_count(NODE), before);
    }

    #[test]
    fn test_non_retryable_kinds_route_to_error() {
        let router = router();
        for error in [
            NodeError::validation("bad mesh"),
            NodeError::critical("segfault"),
            NodeError::cancelled("stop"),
            NodeError::resource("no gpu"),
        ] {
            let state = failed_state(error);
            let decision = router.retry(&state, NODE, "error", None);
            assert_eq!(decision.target(), Some("error"));
            assert_eq!(decision.reason(), DecisionReason::NonRetryable);
            assert!(decision.updates().is_empty());
        }
    }

    #[test]
    fn test_resource_error_uses_fallback() {
        let router = router();
        let state = failed_state(NodeError::resource("out of memory"));
        let decision = router.retry(&state, NODE, "error", Some("execute:cfd:reduced"));
        assert_eq!(decision.target(), Some("execute:cfd:reduced"));
        assert_eq!(decision.reason(), DecisionReason::ResourceFallback);
    }

    #[test]
    fn test_breaker_opens_at_threshold_despite_retry_budget() {
        let router = router();
        let now = Utc::now();
        let mut state = failed_state(NodeError::execution("diverged"));

        let first = router.circuit_breaker(&state, NODE, "join", "error", None, now);
        assert_eq!(first.reason(), DecisionReason::Retry);
        state.apply(&first);
        assert_eq!(state.breaker(NODE).consecutive_failures, 1);

        let second = router.circuit_breaker(&state, NODE, "join", "error", None, now);
        assert_eq!(second.reason(), DecisionReason::BreakerOpen);
        assert_eq!(second.target(), Some("error"));
        state.apply(&second);
        assert_eq!(state.breaker(NODE).state, CircuitState::Open);
        assert!(router.backoff().allows_retry(state.retry_count(NODE)));

        // Gate rejects until the cool-down has elapsed
        let gate = router.breaker_gate(&state, NODE, "error", now + chrono::Duration::seconds(10));
        assert_eq!(gate.reason(), DecisionReason::BreakerOpen);

        let gate = router.breaker_gate(&state, NODE, "error", now + chrono::Duration::seconds(31));
        assert_eq!(gate.reason(), DecisionReason::BreakerProbe);
        assert_eq!(gate.target(), Some(NODE));
        state.apply(&gate);
        assert_eq!(state.breaker(NODE).state, CircuitState::HalfOpen);

        // Only one probe at a time
        let again = router.breaker_gate(&state, NODE, "error", now + chrono::Duration::seconds(32));
        assert_eq!(again.reason(), DecisionReason::BreakerOpen);
    }

    #[test]
    fn test_release_breaker_reopens_cancelled_half_open_node() {
        let router = router();
        let now = Utc::now();
        let mut state = ExecutionState::new(Uuid::now_v7());
        assert!(router.release_breaker(&state, NODE, "join").is_none());

        let opened = now - chrono::Duration::seconds(60);
        state.apply(&RoutingDecision::wait(DecisionReason::BreakerProbe).with_update(
            StateUpdate::Breaker {
                node: NODE.into(),
                state: CircuitBreakerState {
                    state: CircuitState::HalfOpen,
                    consecutive_failures: 2,
                    opened_at: Some(opened),
                },
            },
        ));

        let released = router.release_breaker(&state, NODE, "join").unwrap();
        assert_eq!(released.reason(), DecisionReason::BreakerOpen);
        assert_eq!(released.target(), Some("join"));
        state.apply(&released);
        assert_eq!(state.breaker(NODE).state, CircuitState::Open);
        assert_eq!(state.breaker(NODE).opened_at, Some(opened));

        // Cool-down already elapsed, so the next attempt is admitted half-open
        let gate = router.breaker_gate(&state, NODE, "error", now);
        assert_eq!(gate.reason(), DecisionReason::BreakerProbe);
    }

    #[test]
    fn test_probe_outcomes() {
        let router = router();
        let now = Utc::now();
        let half_open = CircuitBreakerState {
            state: CircuitState::HalfOpen,
            consecutive_failures: 2,
            opened_at: Some(now - chrono::Duration::seconds(60)),
        };

        let mut state = failed_state(NodeError::execution("again"));
        state.apply(&RoutingDecision::wait(DecisionReason::BreakerProbe).with_update(
            StateUpdate::Breaker {
                node: NODE.into(),
                state: half_open.clone(),
            },
        ));
        let failed = router.circuit_breaker(&state, NODE, "join", "error", None, now);
        assert_eq!(failed.reason(), DecisionReason::BreakerOpen);
        state.apply(&failed);
        assert_eq!(state.breaker(NODE).state, CircuitState::Open);
        assert_eq!(state.breaker(NODE).opened_at, Some(now));

        state.apply(&RoutingDecision::wait(DecisionReason::BreakerProbe).with_update(
            StateUpdate::Breaker {
                node: NODE.into(),
                state: half_open,
            },
        ));
        state.set_status(NODE, NodeStatus::Success);
        let closed = router.circuit_breaker(&state, NODE, "join", "error", None, now);
        assert_eq!(closed.target(), Some("join"));
        state.apply(&closed);
        assert_eq!(state.breaker(NODE), CircuitBreakerState::closed());
    }

    #[test]
    fn test_conditional_first_match_wins() {
        let router = router();
        let mut state = ExecutionState::new(Uuid::now_v7());
        state.set_context("validation_passed", false);
        state.set_context("iterations_remaining", 2);

        let rules = vec![
            BranchRule::new("validation_passed", Predicate::Equals(json!(true)), "aggregate"),
            BranchRule::new("iterations_remaining", Predicate::GreaterThan(0.0), "delegate"),
            BranchRule::new("iterations_remaining", Predicate::Exists, "unreachable"),
        ];
        let decision = router.conditional(&state, &rules, "done");
        assert_eq!(decision.target(), Some("delegate"));
        assert_eq!(decision.metadata()["rule"], 1);

        state.set_context("iterations_remaining", 0);
        let decision = router.conditional(&state, &rules[..2], "done");
        assert_eq!(decision.target(), Some("done"));
        assert_eq!(decision.reason(), DecisionReason::DefaultBranch);
    }

    #[test]
    fn test_resource_aware() {
        let router = router();
        let capacity = StaticCapacity::new(ResourceSnapshot::new(16.0, 65_536, 0));
        let cpu_job = ResourceRequirement::new(8.0, 16_384, 0);
        let gpu_job = ResourceRequirement::new(8.0, 16_384, 1);

        let decision = router.resource_aware(&cpu_job, &capacity, "primary", "fallback");
        assert_eq!(decision.target(), Some("primary"));

        let decision = router.resource_aware(&gpu_job, &capacity, "primary", "fallback");
        assert_eq!(decision.target(), Some("fallback"));
        assert_eq!(decision.metadata()["shortfalls"], json!(["gpu"]));
    }

    #[test]
    fn test_performance_prefers_reliability() {
        let router = router();
        let metrics = MetricsStore::new();
        metrics.insert(
            "X",
            ExecutionMetrics {
                success_count: 9,
                failure_count: 1,
                mean_duration: Duration::from_secs(5),
            },
        );
        metrics.insert(
            "Y",
            ExecutionMetrics {
                success_count: 19,
                failure_count: 1,
                mean_duration: Duration::from_secs(8),
            },
        );

        let decision = router.select_by_performance(&["X", "Y"], &metrics);
        assert_eq!(decision.target(), Some("Y"));
    }

    #[test]
    fn test_performance_ties() {
        let router = router();
        let metrics = MetricsStore::new();
        let stats = |duration| ExecutionMetrics {
            success_count: 1,
            failure_count: 1,
            mean_duration: Duration::from_secs(duration),
        };
        metrics.insert("slow", stats(9));
        metrics.insert("fast", stats(3));
        metrics.insert("fast-too", stats(3));

        let decision = router.select_by_performance(&["slow", "fast", "fast-too"], &metrics);
        assert_eq!(decision.target(), Some("fast"));

        // Untried candidates look perfect and win by declaration order
        let decision = router.select_by_performance(&["fast", "new-a", "new-b"], &metrics);
        assert_eq!(decision.target(), Some("new-a"));

        let none: [&str; 0] = [];
        let decision = router.select_by_performance(&none, &metrics);
        assert_eq!(decision.reason(), DecisionReason::NoCandidates);
        assert!(decision.is_wait());
    }

    #[test]
    fn test_fan_out() {
        let decision = router().fan_out(&["execute:fem", "execute:md"]);
        assert_eq!(decision.next(), ["execute:fem", "execute:md"]);
        assert_eq!(decision.reason(), DecisionReason::FanOut);
    }

    #[test]
    fn test_join_waits_for_all_branches() {
        let router = router();
        let branches = ["a", "b", "c"];
        let mut state = ExecutionState::new(Uuid::now_v7());
        state.set_status("a", NodeStatus::Success);
        state.set_status("b", NodeStatus::Running);

        for policy in [FailurePolicy::Strict, FailurePolicy::Tolerant] {
            let decision = router.join(&state, &branches, policy, "validate", "handle_error");
            assert!(decision.is_wait());
            assert_eq!(decision.reason(), DecisionReason::JoinWaiting);
        }

        state.set_status("b", NodeStatus::Success);
        state.set_status("c", NodeStatus::Success);
        let decision = router.join(&state, &branches, FailurePolicy::Strict, "validate", "handle_error");
        assert_eq!(decision.target(), Some("validate"));
    }

    #[test]
    fn test_join_strict_short_circuit() {
        let router = router();
        let branches = ["a", "b", "c"];
        let mut state = ExecutionState::new(Uuid::now_v7());
        state.set_status("a", NodeStatus::Failure);
        state.set_status("b", NodeStatus::Running);
        state.set_status("c", NodeStatus::Success);

        let decision = router.join(&state, &branches, FailurePolicy::Strict, "validate", "handle_error");
        assert!(decision.is_wait());
        assert_eq!(decision.reason(), DecisionReason::JoinShortCircuit);
        assert_eq!(decision.cancellations().collect::<Vec<_>>(), vec!["b"]);

        state.set_status("b", NodeStatus::Cancelled);
        let decision = router.join(&state, &branches, FailurePolicy::Strict, "validate", "handle_error");
        assert_eq!(decision.target(), Some("handle_error"));
        assert_eq!(decision.reason(), DecisionReason::JoinFailed);
    }

    #[test]
    fn test_join_tolerant_proceeds_with_failures() {
        let router = router();
        let mut state = ExecutionState::new(Uuid::now_v7());
        state.set_status("a", NodeStatus::Failure);
        state.set_status("b", NodeStatus::Success);

        let decision = router.join(&state, &["a", "b"], FailurePolicy::Tolerant, "validate", "handle_error");
        assert_eq!(decision.target(), Some("validate"));
        assert_eq!(decision.metadata()["failed"], json!(["a"]));
    }
}
