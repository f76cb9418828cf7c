// Orchestration events
//
// Append-only, structured events emitted by the engine for an external
// provenance/audit component. The engine never reads them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{TaskId, TaskStatus};

/// Events emitted during orchestration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// Workflow accepted by the conductor
    WorkflowStarted {
        workflow_id: Uuid,
        request: String,
        max_iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// Controller entered a node
    NodeEntered {
        workflow_id: Uuid,
        node: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// Router produced a decision
    DecisionMade {
        workflow_id: Uuid,
        from: String,
        next: Vec<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A failed node is being retried
    RetryAttempted {
        workflow_id: Uuid,
        node: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Circuit breaker for a node opened
    BreakerOpened {
        workflow_id: Uuid,
        node: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// Circuit breaker cool-down elapsed, one probe allowed
    BreakerHalfOpened {
        workflow_id: Uuid,
        node: String,
        timestamp: DateTime<Utc>,
    },

    /// Circuit breaker for a node closed after a successful probe
    BreakerClosed {
        workflow_id: Uuid,
        node: String,
        timestamp: DateTime<Utc>,
    },

    /// Task handed to the executor
    TaskSubmitted {
        task_id: TaskId,
        tool: String,
        timestamp: DateTime<Utc>,
    },

    /// Task reached a terminal status
    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
    },

    /// Workflow finished successfully
    WorkflowCompleted {
        workflow_id: Uuid,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// Workflow finished with a failure
    WorkflowFailed {
        workflow_id: Uuid,
        iterations: u32,
        error_count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    pub fn workflow_started(workflow_id: Uuid, request: impl Into<String>, max_iterations: u32) -> Self {
        Self::WorkflowStarted {
            workflow_id,
            request: request.into(),
            max_iterations,
            timestamp: Utc::now(),
        }
    }

    pub fn node_entered(workflow_id: Uuid, node: impl Into<String>, iteration: u32) -> Self {
        Self::NodeEntered {
            workflow_id,
            node: node.into(),
            iteration,
            timestamp: Utc::now(),
        }
    }

    pub fn decision_made(
        workflow_id: Uuid,
        from: impl Into<String>,
        next: Vec<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DecisionMade {
            workflow_id,
            from: from.into(),
            next,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn retry_attempted(
        workflow_id: Uuid,
        node: impl Into<String>,
        attempt: u32,
        delay: std::time::Duration,
    ) -> Self {
        Self::RetryAttempted {
            workflow_id,
            node: node.into(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn breaker_opened(workflow_id: Uuid, node: impl Into<String>, consecutive_failures: u32) -> Self {
        Self::BreakerOpened {
            workflow_id,
            node: node.into(),
            consecutive_failures,
            timestamp: Utc::now(),
        }
    }

    pub fn breaker_half_opened(workflow_id: Uuid, node: impl Into<String>) -> Self {
        Self::BreakerHalfOpened {
            workflow_id,
            node: node.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn breaker_closed(workflow_id: Uuid, node: impl Into<String>) -> Self {
        Self::BreakerClosed {
            workflow_id,
            node: node.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task_submitted(task_id: TaskId, tool: impl Into<String>) -> Self {
        Self::TaskSubmitted {
            task_id,
            tool: tool.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task_finished(task_id: TaskId, status: TaskStatus) -> Self {
        Self::TaskFinished {
            task_id,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn workflow_completed(workflow_id: Uuid, iterations: u32) -> Self {
        Self::WorkflowCompleted {
            workflow_id,
            iterations,
            timestamp: Utc::now(),
        }
    }

    pub fn workflow_failed(workflow_id: Uuid, iterations: u32, error_count: usize) -> Self {
        Self::WorkflowFailed {
            workflow_id,
            iterations,
            error_count,
            timestamp: Utc::now(),
        }
    }

    /// Snake-case event name, matching the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::NodeEntered { .. } => "node_entered",
            Self::DecisionMade { .. } => "decision_made",
            Self::RetryAttempted { .. } => "retry_attempted",
            Self::BreakerOpened { .. } => "breaker_opened",
            Self::BreakerHalfOpened { .. } => "breaker_half_opened",
            Self::BreakerClosed { .. } => "breaker_closed",
            Self::TaskSubmitted { .. } => "task_submitted",
            Self::TaskFinished { .. } => "task_finished",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
        }
    }

    /// Owning workflow, if the event is workflow-scoped
    pub fn workflow_id(&self) -> Option<Uuid> {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::NodeEntered { workflow_id, .. }
            | Self::DecisionMade { workflow_id, .. }
            | Self::RetryAttempted { workflow_id, .. }
            | Self::BreakerOpened { workflow_id, .. }
            | Self::BreakerHalfOpened { workflow_id, .. }
            | Self::BreakerClosed { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. } => Some(*workflow_id),
            Self::TaskSubmitted { .. } | Self::TaskFinished { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_matches_serde_tag() {
        let event = OrchestrationEvent::breaker_opened(Uuid::now_v7(), "execute:cfd", 3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
    }

    #[test]
    fn test_task_events_are_not_workflow_scoped() {
        let event = OrchestrationEvent::task_submitted(Uuid::now_v7(), "lammps");
        assert!(event.workflow_id().is_none());

        let workflow_id = Uuid::now_v7();
        let event = OrchestrationEvent::node_entered(workflow_id, "analyze", 1);
        assert_eq!(event.workflow_id(), Some(workflow_id));
    }

    #[test]
    fn test_retry_event_records_delay_in_millis() {
        let event = OrchestrationEvent::retry_attempted(
            Uuid::now_v7(),
            "execute:fem",
            2,
            std::time::Duration::from_millis(250),
        );
        match event {
            OrchestrationEvent::RetryAttempted { delay_ms, attempt, .. } => {
                assert_eq!(delay_ms, 250);
                assert_eq!(attempt, 2);
            }
            _ => panic!("Expected RetryAttempted"),
        }
    }
}
