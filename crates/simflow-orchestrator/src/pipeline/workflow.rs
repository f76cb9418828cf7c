//! Batch submission and aggregated waiting

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use simflow_core::{NodeError, Task, TaskId, TaskSpec, TaskStatus};
use tracing::{info, instrument};

use super::TaskPipeline;
use crate::error::PipelineError;

/// How failures affect a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed or cancelled task fails the whole batch
    #[default]
    Strict,
    /// Failures are tolerated as long as something succeeded
    Tolerant,
}

/// Batch submission mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubmissionMode {
    /// Submit each task only after the previous one is terminal
    pub sequential: bool,
    pub policy: FailurePolicy,
}

impl SubmissionMode {
    pub fn parallel(policy: FailurePolicy) -> Self {
        Self {
            sequential: false,
            policy,
        }
    }

    pub fn sequential(policy: FailurePolicy) -> Self {
        Self {
            sequential: true,
            policy,
        }
    }
}

/// Aggregated status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    /// Aggregate terminal task statuses under `policy`
    pub fn aggregate<'a>(
        statuses: impl IntoIterator<Item = &'a TaskStatus>,
        policy: FailurePolicy,
    ) -> Self {
        let (mut succeeded, mut failed) = (0usize, 0usize);
        for status in statuses {
            if *status == TaskStatus::Success {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }
        match policy {
            FailurePolicy::Strict if failed > 0 => RunStatus::Failed,
            FailurePolicy::Strict => RunStatus::Completed,
            FailurePolicy::Tolerant if failed == 0 => RunStatus::Completed,
            FailurePolicy::Tolerant if succeeded > 0 => RunStatus::Partial,
            FailurePolicy::Tolerant => RunStatus::Failed,
        }
    }
}

/// Outcome of waiting on a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub status: RunStatus,

    /// Every task of the batch in submission order, with its own status,
    /// result and error
    pub tasks: IndexMap<TaskId, Task>,
}

impl WorkflowRun {
    pub fn statuses(&self) -> IndexMap<TaskId, TaskStatus> {
        self.tasks.iter().map(|(id, t)| (*id, t.status)).collect()
    }

    /// Errors of failed tasks, in submission order
    pub fn errors(&self) -> Vec<(TaskId, &NodeError)> {
        self.tasks
            .iter()
            .filter_map(|(id, t)| t.error.as_ref().map(|e| (*id, e)))
            .collect()
    }
}

impl TaskPipeline {
    /// Submit a batch of specs
    ///
    /// Every tool is validated before anything is submitted. In sequential
    /// mode this resolves only after the last submitted task is terminal;
    /// under `Strict`, a failure stops the batch and the remaining specs are
    /// never submitted.
    #[instrument(skip(self, specs), fields(count = specs.len(), sequential = mode.sequential))]
    pub async fn submit_workflow(
        &self,
        specs: Vec<TaskSpec>,
        mode: SubmissionMode,
    ) -> Result<Vec<TaskId>, PipelineError> {
        for spec in &specs {
            self.validate(spec)?;
        }

        if !mode.sequential {
            return specs.into_iter().map(|spec| self.submit(spec)).collect();
        }

        let total = specs.len();
        let mut ids = Vec::with_capacity(total);
        for spec in specs {
            let id = self.submit(spec)?;
            ids.push(id);
            let task = self.wait_unbounded(id).await?;
            if task.status.is_failure() && mode.policy == FailurePolicy::Strict {
                info!(
                    task_id = %id,
                    skipped = total - ids.len(),
                    "sequential batch stopped after failure"
                );
                break;
            }
        }
        Ok(ids)
    }

    /// Wait for every task of a batch and aggregate the outcome
    pub async fn wait_workflow(
        &self,
        ids: &[TaskId],
        timeout: Duration,
        policy: FailurePolicy,
    ) -> Result<WorkflowRun, PipelineError> {
        // Fail fast on unknown ids
        for id in ids {
            self.status(*id)?;
        }

        let waits = ids.iter().map(|id| self.wait_unbounded(*id));
        let tasks = match tokio::time::timeout(timeout, futures::future::join_all(waits)).await {
            Ok(results) => results.into_iter().collect::<Result<Vec<_>, _>>()?,
            Err(_) => {
                let pending = ids
                    .iter()
                    .filter(|id| {
                        self.status(**id)
                            .map(|t| !t.is_terminal())
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect();
                return Err(PipelineError::WorkflowTimeout {
                    pending,
                    waited: timeout,
                });
            }
        };

        let tasks: IndexMap<TaskId, Task> = tasks.into_iter().map(|t| (t.id, t)).collect();
        let status = RunStatus::aggregate(tasks.values().map(|t| &t.status), policy);
        Ok(WorkflowRun { status, tasks })
    }
}
