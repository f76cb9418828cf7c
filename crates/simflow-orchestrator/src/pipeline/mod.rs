//! Asynchronous task pipeline
//!
//! This module provides:
//! - [`TaskPipeline`] - Non-blocking submission, snapshots, waiting and cancellation
//! - [`SubmissionMode`] / [`FailurePolicy`] - Batch submission semantics
//! - [`WorkflowRun`] - Aggregated outcome of a batch

mod handle;
mod task_pipeline;
mod workflow;

pub use task_pipeline::{PipelineConfig, TaskPipeline};
pub use workflow::{FailurePolicy, RunStatus, SubmissionMode, WorkflowRun};
