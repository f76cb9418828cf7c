// Error types for the orchestrator
//
// Node-level failures are values (NodeError) carried in task snapshots and
// execution state. The enums here cover the surfaces that can fail outright:
// pipeline calls, executor setup, workflow definition and configuration.

use std::time::Duration;

use simflow_core::{NodeError, TaskId};
use thiserror::Error;

/// Errors returned by `TaskPipeline` operations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Tool is not a registered capability of the executor
    #[error("Validation error: unknown tool '{0}'")]
    Validation(String),

    /// No task with this id
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// Task did not reach a terminal status in time; the job keeps running
    #[error("Timed out after {waited:?} waiting for task {task_id}")]
    Timeout { task_id: TaskId, waited: Duration },

    /// Some tasks of a workflow did not finish in time
    #[error("Timed out after {waited:?} waiting for {} workflow task(s)", .pending.len())]
    WorkflowTimeout { pending: Vec<TaskId>, waited: Duration },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(tool: impl Into<String>) -> Self {
        PipelineError::Validation(tool.into())
    }

    /// Convert into a classified node error for routing
    pub fn into_node_error(self) -> NodeError {
        match &self {
            PipelineError::Validation(_) => NodeError::validation(self.to_string()),
            PipelineError::NotFound(_) => NodeError::critical(self.to_string()),
            PipelineError::Timeout { .. } | PipelineError::WorkflowTimeout { .. } => {
                NodeError::timeout(self.to_string())
            }
            PipelineError::Internal(_) => NodeError::execution(self.to_string()),
        }
    }
}

/// Errors raised while launching a job, before it produces a result
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// No program configured for a tool
    #[error("No program registered for tool '{0}'")]
    UnknownTool(String),

    /// Child process could not be started
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while talking to the job
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecutorError> for NodeError {
    fn from(err: ExecutorError) -> Self {
        match &err {
            ExecutorError::UnknownTool(_) => NodeError::validation(err.to_string()),
            ExecutorError::Spawn { .. } => NodeError::critical(err.to_string()),
            ExecutorError::Io(_) => NodeError::from_message(err.to_string()),
        }
    }
}

/// Workflow-definition errors; the only errors that abort a workflow
#[derive(Debug, Error)]
pub enum ConductorError {
    /// No classification rule matched the request
    #[error("No role matches request: {0}")]
    NoMatch(String),

    /// The plan cannot be executed as defined
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// The spawned workflow task failed to complete
    #[error("Workflow task failed: {0}")]
    Join(String),
}

impl ConductorError {
    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        ConductorError::InvalidPlan(msg.into())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    Parse {
        var: String,
        value: String,
        reason: String,
    },

    /// A value is out of range or inconsistent with another
    #[error("Invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflow_core::ErrorKind;
    use uuid::Uuid;

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::validation("comsol");
        assert_eq!(err.to_string(), "Validation error: unknown tool 'comsol'");

        let err = PipelineError::WorkflowTimeout {
            pending: vec![Uuid::now_v7(), Uuid::now_v7()],
            waited: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("2 workflow task(s)"));
    }

    #[test]
    fn test_pipeline_error_classification() {
        assert_eq!(
            PipelineError::validation("x").into_node_error().kind,
            ErrorKind::Validation
        );
        let timeout = PipelineError::Timeout {
            task_id: Uuid::now_v7(),
            waited: Duration::from_millis(5),
        };
        assert_eq!(timeout.into_node_error().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_executor_error_into_node_error() {
        let err: NodeError = ExecutorError::UnknownTool("su2".into()).into();
        assert_eq!(err.kind, ErrorKind::Validation);

        let err: NodeError = ExecutorError::Spawn {
            program: "/opt/missing".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Critical);
    }
}
