// Per-workflow execution state
//
// Decision: Readers get shared references; every mutator is crate-private so
// only the conductor that owns the state can change it. Routers receive
// `&ExecutionState` and describe changes as StateUpdates instead.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use simflow_core::serde_helpers::duration_millis;
use simflow_core::{NodeError, TaskId, TaskStatus};
use uuid::Uuid;

use super::decision::{RoutingDecision, StateUpdate};
use crate::reliability::CircuitBreakerState;

/// Status of a workflow node; nodes share the task lifecycle
pub type NodeStatus = TaskStatus;

/// Last recorded result of a node
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NodeResult {
    /// Performer that produced the result
    pub performer: Option<String>,
    pub task_id: Option<TaskId>,
    pub output: Option<Value>,
    pub error: Option<NodeError>,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// 1-based attempt number within the current iteration
    pub attempt: u32,
    /// Ran with reduced resource parameters
    pub reduced: bool,
}

/// One node-level error, in the order it was observed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeErrorRecord {
    pub node: String,
    pub iteration: u32,
    pub attempt: u32,
    pub error: NodeError,
    pub recorded_at: DateTime<Utc>,
}

/// Mutable state of one workflow
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState {
    workflow_id: Uuid,
    node_status: IndexMap<String, NodeStatus>,
    node_results: IndexMap<String, NodeResult>,
    retry_count: HashMap<String, u32>,
    breakers: HashMap<String, CircuitBreakerState>,
    iteration: u32,
    context: Map<String, Value>,
    errors: Vec<NodeErrorRecord>,
}

impl ExecutionState {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            node_status: IndexMap::new(),
            node_results: IndexMap::new(),
            retry_count: HashMap::new(),
            breakers: HashMap::new(),
            iteration: 0,
            context: Map::new(),
            errors: Vec::new(),
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Status of a node; unknown nodes are `Pending`
    pub fn status(&self, node: &str) -> NodeStatus {
        self.node_status
            .get(node)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    pub fn node_statuses(&self) -> &IndexMap<String, NodeStatus> {
        &self.node_status
    }

    pub fn result(&self, node: &str) -> Option<&NodeResult> {
        self.node_results.get(node)
    }

    /// Error of the node's last result
    pub fn error_of(&self, node: &str) -> Option<&NodeError> {
        self.node_results.get(node).and_then(|r| r.error.as_ref())
    }

    pub fn retry_count(&self, node: &str) -> u32 {
        self.retry_count.get(node).copied().unwrap_or(0)
    }

    /// Breaker of a node; unknown nodes are closed
    pub fn breaker(&self, node: &str) -> CircuitBreakerState {
        self.breakers.get(node).cloned().unwrap_or_default()
    }

    /// Current iteration, starting at 1 once execution begins
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Every node-level error observed so far
    pub fn errors(&self) -> &[NodeErrorRecord] {
        &self.errors
    }

    pub(crate) fn set_status(&mut self, node: &str, status: NodeStatus) {
        self.node_status.insert(node.to_string(), status);
    }

    pub(crate) fn record_result(&mut self, node: &str, result: NodeResult) {
        self.node_results.insert(node.to_string(), result);
    }

    pub(crate) fn record_error(&mut self, node: &str, attempt: u32, error: NodeError) {
        self.errors.push(NodeErrorRecord {
            node: node.to_string(),
            iteration: self.iteration,
            attempt,
            error,
            recorded_at: Utc::now(),
        });
    }

    pub(crate) fn set_context(&mut self, key: &str, value: impl Into<Value>) {
        self.context.insert(key.to_string(), value.into());
    }

    pub(crate) fn begin_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    /// Forget a node's status, result and retry budget; breakers persist
    pub(crate) fn reset_node(&mut self, node: &str) {
        self.node_status.insert(node.to_string(), NodeStatus::Pending);
        self.node_results.shift_remove(node);
        self.retry_count.remove(node);
    }

    /// Apply the state changes carried by a decision
    pub(crate) fn apply(&mut self, decision: &RoutingDecision) {
        for update in decision.updates() {
            match update {
                StateUpdate::IncrementRetry { node } => {
                    *self.retry_count.entry(node.clone()).or_insert(0) += 1;
                }
                StateUpdate::ResetRetry { node } => {
                    self.retry_count.remove(node);
                }
                StateUpdate::Breaker { node, state } => {
                    self.breakers.insert(node.clone(), state.clone());
                }
                // Executed by the controller; nothing to record here
                StateUpdate::Cancel { .. } => {}
            }
        }
    }
}
