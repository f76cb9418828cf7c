// Task data model
//
// A Task is one unit of work handed to an external executor. Status only moves
// forward (Pending -> Running -> terminal) and a terminal task never changes
// again; every mutator reports whether it was applied.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NodeError;

/// Task identifier (UUID v7, sortable by submission time)
pub type TaskId = Uuid;

/// Insertion-ordered task parameters
pub type TaskParams = IndexMap<String, serde_json::Value>;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// Failure or cancellation
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure | Self::Cancelled)
    }

    /// Whether moving to `next` keeps the status monotonic
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Description of work that has not been submitted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Capability name understood by the executor (e.g. "openfoam")
    pub tool: String,

    /// Script or input deck passed to the tool
    pub script: String,

    /// Ordered parameters
    #[serde(default)]
    pub params: TaskParams,
}

impl TaskSpec {
    pub fn new(tool: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            script: script.into(),
            params: TaskParams::new(),
        }
    }

    /// Add or replace a parameter, keeping its original position
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params.extend(params);
        self
    }
}

/// Snapshot of a submitted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tool: String,
    pub script: String,
    pub params: TaskParams,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress in `[0, 1]` as reported by the executor
    pub progress: Option<f64>,

    pub result: Option<serde_json::Value>,
    pub error: Option<NodeError>,
}

impl Task {
    /// Create a pending task from a spec
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: Uuid::now_v7(),
            tool: spec.tool,
            script: spec.script,
            params: spec.params,
            status: TaskStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time from start (or submission if never started) to completion
    pub fn elapsed(&self) -> Option<Duration> {
        let end = self.completed_at?;
        let start = self.started_at.unwrap_or(self.submitted_at);
        end.signed_duration_since(start).to_std().ok()
    }

    pub fn mark_running(&mut self) -> bool {
        if !self.status.can_transition_to(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn succeed(&mut self, result: serde_json::Value) -> bool {
        if !self.finish(TaskStatus::Success) {
            return false;
        }
        self.progress = Some(1.0);
        self.result = Some(result);
        true
    }

    pub fn fail(&mut self, error: NodeError) -> bool {
        if !self.finish(TaskStatus::Failure) {
            return false;
        }
        self.error = Some(error);
        true
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> bool {
        if !self.finish(TaskStatus::Cancelled) {
            return false;
        }
        self.error = Some(NodeError::cancelled(reason));
        true
    }

    /// Record progress; ignored once terminal
    pub fn set_progress(&mut self, progress: f64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.progress = Some(progress.clamp(0.0, 1.0));
        true
    }

    fn finish(&mut self, status: TaskStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }
}
