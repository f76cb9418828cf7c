//! Job execution context

use std::sync::Arc;

use simflow_core::{Task, TaskId, TaskParams};
use tokio_util::sync::CancellationToken;

type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Context handed to an executor for one job
///
/// The context provides:
/// - The job description (tool, script, params)
/// - Progress reporting visible in task snapshots
/// - Cancellation detection
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: JobContext) -> Result<Value, NodeError> {
///     for step in 0..10 {
///         tokio::select! {
///             _ = ctx.cancelled() => return Err(NodeError::cancelled("stopped")),
///             _ = run_step(step) => {}
///         }
///         ctx.report_progress((step + 1) as f64 / 10.0);
///     }
///     Ok(json!({"converged": true}))
/// }
/// ```
#[derive(Clone)]
pub struct JobContext {
    pub task_id: TaskId,
    pub tool: String,
    pub script: String,
    pub params: TaskParams,

    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl JobContext {
    /// Build a context for a submitted task
    pub fn new(task: &Task, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id,
            tool: task.tool.clone(),
            script: task.script.clone(),
            params: task.params.clone(),
            cancel,
            progress: None,
        }
    }

    /// Attach a progress callback
    pub fn with_progress(mut self, progress: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Publish progress in `[0, 1]`; values outside are clamped
    pub fn report_progress(&self, progress: f64) {
        if let Some(report) = &self.progress {
            report(progress.clamp(0.0, 1.0));
        }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("task_id", &self.task_id)
            .field("tool", &self.tool)
            .field("script", &self.script)
            .field("params", &self.params)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
