//! TaskPipeline: submission, status, waiting and cancellation

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use simflow_core::serde_helpers::{duration_millis, option_duration_millis};
use simflow_core::{
    emit_or_warn, EventSink, NodeError, NoopEventSink, OrchestrationEvent, Task, TaskId, TaskSpec,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::handle::TaskHandle;
use crate::error::PipelineError;
use crate::executor::{JobContext, TaskExecutor};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Maximum jobs running at once; further jobs stay pending
    pub max_concurrency: usize,

    /// Hard limit for a single job; exceeded jobs fail with a timeout error
    #[serde(default, with = "option_duration_millis")]
    pub task_timeout: Option<Duration>,

    /// Wait budget used by callers that do not pass their own
    #[serde(with = "duration_millis")]
    pub default_wait_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            task_timeout: None,
            default_wait_timeout: Duration::from_secs(3600),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout = timeout;
        self
    }
}

/// Asynchronous task pipeline over a pluggable executor
///
/// `submit` returns as soon as the job is spawned. Each job runs in its own
/// tokio task which:
/// 1. waits for a concurrency permit (cancellable while queued)
/// 2. runs the executor, racing it against cancellation and `task_timeout`
/// 3. publishes the terminal snapshot and a `task_finished` event
///
/// # Example
///
/// ```ignore
/// let pipeline = TaskPipeline::new(Arc::new(StubExecutor::new(["lammps"])), PipelineConfig::default());
/// let id = pipeline.submit(TaskSpec::new("lammps", "md_run.in"))?;
/// let task = pipeline.wait(id, Duration::from_secs(60)).await?;
/// ```
pub struct TaskPipeline {
    executor: Arc<dyn TaskExecutor>,
    capabilities: HashSet<String>,
    tasks: DashMap<TaskId, Arc<TaskHandle>>,
    permits: Arc<Semaphore>,
    config: PipelineConfig,
    sink: Arc<dyn EventSink>,
}

impl TaskPipeline {
    pub fn new(executor: Arc<dyn TaskExecutor>, config: PipelineConfig) -> Self {
        let capabilities = executor.capabilities().into_iter().collect();
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            executor,
            capabilities,
            tasks: DashMap::new(),
            permits,
            config,
            sink: Arc::new(NoopEventSink),
        }
    }

    /// Emit task lifecycle events to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Whether `tool` is a registered capability
    pub fn supports(&self, tool: &str) -> bool {
        self.capabilities.contains(tool)
    }

    /// Validate a spec without submitting it
    pub fn validate(&self, spec: &TaskSpec) -> Result<(), PipelineError> {
        if self.supports(&spec.tool) {
            Ok(())
        } else {
            Err(PipelineError::validation(&spec.tool))
        }
    }

    /// Submit a job; returns immediately with its id
    #[instrument(skip(self, spec), fields(tool = %spec.tool))]
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, PipelineError> {
        self.validate(&spec)?;

        let task = Task::new(spec);
        let task_id = task.id;
        let tool = task.tool.clone();
        let handle = Arc::new(TaskHandle::new(task));
        self.tasks.insert(task_id, handle.clone());

        let sink = self.sink.clone();
        let runner = run_task(
            self.executor.clone(),
            handle,
            self.permits.clone(),
            self.config.task_timeout,
            sink.clone(),
        );
        tokio::spawn(async move {
            emit_or_warn(sink.as_ref(), OrchestrationEvent::task_submitted(task_id, tool)).await;
            runner.await;
        });

        debug!(%task_id, "task submitted");
        Ok(task_id)
    }

    /// Current snapshot of a task
    pub fn status(&self, task_id: TaskId) -> Result<Task, PipelineError> {
        self.handle(task_id).map(|h| h.snapshot())
    }

    /// Wait until the task is terminal
    ///
    /// On timeout the job keeps running; only the wait is abandoned.
    pub async fn wait(&self, task_id: TaskId, timeout: Duration) -> Result<Task, PipelineError> {
        let handle = self.handle(task_id)?;
        match tokio::time::timeout(timeout, wait_terminal(&handle)).await {
            Ok(task) => Ok(task),
            Err(_) => Err(PipelineError::Timeout {
                task_id,
                waited: timeout,
            }),
        }
    }

    /// Wait without a time limit
    pub(crate) async fn wait_unbounded(&self, task_id: TaskId) -> Result<Task, PipelineError> {
        let handle = self.handle(task_id)?;
        Ok(wait_terminal(&handle).await)
    }

    /// Request cancellation
    ///
    /// The task becomes `Cancelled` once its runner observes the request and
    /// the executor future has been dropped. No-op for terminal tasks.
    pub fn cancel(&self, task_id: TaskId) -> Result<(), PipelineError> {
        let handle = self.handle(task_id)?;
        if handle.snapshot().is_terminal() {
            return Ok(());
        }
        info!(%task_id, "cancelling task");
        handle.cancel_token().cancel();
        Ok(())
    }

    /// Drop a terminal task from the table and return its final snapshot
    ///
    /// Tasks that are still running are kept and `None` is returned.
    pub fn forget(&self, task_id: TaskId) -> Option<Task> {
        self.tasks
            .remove_if(&task_id, |_, handle| handle.snapshot().is_terminal())
            .map(|(_, handle)| handle.snapshot())
    }

    /// Number of tasks still tracked, terminal or not
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks that are not terminal yet
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().snapshot().is_terminal())
            .count()
    }

    fn handle(&self, task_id: TaskId) -> Result<Arc<TaskHandle>, PipelineError> {
        self.tasks
            .get(&task_id)
            .map(|entry| entry.value().clone())
            .ok_or(PipelineError::NotFound(task_id))
    }
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("capabilities", &self.capabilities)
            .field("tasks", &self.tasks.len())
            .field("available_permits", &self.permits.available_permits())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn wait_terminal(handle: &TaskHandle) -> Task {
    let mut rx = handle.subscribe();
    let result = rx.wait_for(|task| task.is_terminal()).await.map(|t| t.clone());
    match result {
        Ok(task) => task,
        // Sender lives in the handle we hold, so the channel cannot close
        Err(_) => handle.snapshot(),
    }
}

enum RunOutcome {
    Finished(Result<serde_json::Value, NodeError>),
    Cancelled,
}

async fn run_task(
    executor: Arc<dyn TaskExecutor>,
    handle: Arc<TaskHandle>,
    permits: Arc<Semaphore>,
    task_timeout: Option<Duration>,
    sink: Arc<dyn EventSink>,
) {
    let cancel = handle.cancel_token().clone();
    let task_id = handle.snapshot().id;

    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = permits.acquire_owned() => permit.ok(),
    };

    let outcome = match permit {
        None if cancel.is_cancelled() => RunOutcome::Cancelled,
        None => RunOutcome::Finished(Err(NodeError::critical("task pipeline closed"))),
        Some(permit) => {
            handle.update(|t| t.mark_running());
            let progress_handle = handle.clone();
            let ctx = JobContext::new(&handle.snapshot(), cancel.clone())
                .with_progress(move |p| {
                    progress_handle.update(|t| t.set_progress(p));
                });

            let job = with_timeout(task_timeout, executor.execute(ctx));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => RunOutcome::Cancelled,
                result = job => RunOutcome::Finished(result),
            };
            drop(permit);
            outcome
        }
    };

    let status = match outcome {
        RunOutcome::Cancelled => {
            handle.update(|t| t.cancel("task cancelled"));
            handle.snapshot().status
        }
        RunOutcome::Finished(Ok(result)) => {
            handle.update(|t| t.succeed(result));
            handle.snapshot().status
        }
        RunOutcome::Finished(Err(error)) => {
            warn!(%task_id, error = %error, "task failed");
            handle.update(|t| t.fail(error));
            handle.snapshot().status
        }
    };

    debug!(%task_id, %status, "task finished");
    emit_or_warn(sink.as_ref(), OrchestrationEvent::task_finished(task_id, status)).await;
}

async fn with_timeout<F>(timeout: Option<Duration>, job: F) -> Result<serde_json::Value, NodeError>
where
    F: Future<Output = Result<serde_json::Value, NodeError>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, job).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::timeout(format!(
                "task exceeded time limit of {limit:?}"
            ))),
        },
        None => job.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{StubExecutor, StubOutcome};
    use serde_json::json;
    use simflow_core::{ErrorKind, InMemoryEventSink, TaskStatus};

    fn pipeline(stub: StubExecutor) -> TaskPipeline {
        TaskPipeline::new(Arc::new(stub), PipelineConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let pipeline = pipeline(StubExecutor::new(["fenics"]));
        let err = pipeline
            .submit(TaskSpec::new("comsol", "model.mph"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(tool) if tool == "comsol"));
        assert_eq!(pipeline.active_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_and_wait_success() {
        let stub = StubExecutor::new(["fenics"])
            .with_fallback(StubOutcome::succeed(json!({"max_stress": 12.5})));
        let pipeline = pipeline(stub);

        let id = pipeline.submit(TaskSpec::new("fenics", "fem_solve.py")).unwrap();
        let task = pipeline.wait(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.result, Some(json!({"max_stress": 12.5})));
        assert_eq!(task.progress, Some(1.0));
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_carries_classified_error() {
        let stub = StubExecutor::new(["lammps"])
            .with_fallback(StubOutcome::fail(NodeError::from_message("CUDA out of memory")));
        let pipeline = pipeline(stub);

        let id = pipeline.submit(TaskSpec::new("lammps", "md_run.in")).unwrap();
        let task = pipeline.wait(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let pipeline = pipeline(StubExecutor::new(["fenics"]));
        let id = uuid::Uuid::now_v7();
        assert!(matches!(pipeline.status(id), Err(PipelineError::NotFound(_))));
        assert!(matches!(pipeline.cancel(id), Err(PipelineError::NotFound(_))));
        assert!(matches!(
            pipeline.wait(id, Duration::from_millis(1)).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_does_not_cancel_job() {
        let stub = StubExecutor::new(["openfoam"]).with_fallback(
            StubOutcome::succeed(json!({"converged": true})).after(Duration::from_secs(10)),
        );
        let pipeline = pipeline(stub);
        let id = pipeline.submit(TaskSpec::new("openfoam", "simpleFoam")).unwrap();

        let err = pipeline.wait(id, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
        assert!(!pipeline.status(id).unwrap().is_terminal());

        let task = pipeline.wait(id, Duration::from_secs(60)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let stub = StubExecutor::new(["openfoam"]).with_fallback(StubOutcome::Hang);
        let pipeline = pipeline(stub);
        let id = pipeline.submit(TaskSpec::new("openfoam", "simpleFoam")).unwrap();

        pipeline.cancel(id).unwrap();
        let task = pipeline.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_forget_releases_only_terminal_tasks() {
        let stub = StubExecutor::new(["fenics", "openfoam"])
            .with_default("openfoam", StubOutcome::Hang);
        let pipeline = pipeline(stub);
        let done = pipeline.submit(TaskSpec::new("fenics", "fem_solve.py")).unwrap();
        let running = pipeline.submit(TaskSpec::new("openfoam", "simpleFoam")).unwrap();
        pipeline.wait(done, Duration::from_secs(5)).await.unwrap();
        assert_eq!(pipeline.len(), 2);

        // Still running: stays tracked
        assert!(pipeline.forget(running).is_none());
        assert_eq!(pipeline.len(), 2);

        let task = pipeline.forget(done).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(pipeline.len(), 1);
        assert!(matches!(pipeline.status(done), Err(PipelineError::NotFound(_))));

        pipeline.cancel(running).unwrap();
        pipeline.wait(running, Duration::from_secs(5)).await.unwrap();
        assert!(pipeline.forget(running).is_some());
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_on_terminal_task() {
        let pipeline = pipeline(StubExecutor::new(["fenics"]));
        let id = pipeline.submit(TaskSpec::new("fenics", "fem_solve.py")).unwrap();
        let done = pipeline.wait(id, Duration::from_secs(5)).await.unwrap();

        pipeline.cancel(id).unwrap();
        pipeline.cancel(id).unwrap();
        assert_eq!(pipeline.status(id).unwrap(), done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_keeps_tasks_pending() {
        let stub = StubExecutor::new(["lammps"]).with_fallback(
            StubOutcome::succeed(json!({"energy": -1.0})).after(Duration::from_secs(5)),
        );
        let pipeline = TaskPipeline::new(
            Arc::new(stub),
            PipelineConfig::default().with_max_concurrency(1),
        );

        let first = pipeline.submit(TaskSpec::new("lammps", "a.in")).unwrap();
        let second = pipeline.submit(TaskSpec::new("lammps", "b.in")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(pipeline.status(first).unwrap().status, TaskStatus::Running);
        assert_eq!(pipeline.status(second).unwrap().status, TaskStatus::Pending);

        // Queued tasks can be cancelled before they start
        pipeline.cancel(second).unwrap();
        let task = pipeline.wait(second, Duration::from_secs(1)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());

        let task = pipeline.wait(first, Duration::from_secs(30)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_fails_job() {
        let stub = StubExecutor::new(["su2"]).with_fallback(StubOutcome::Hang);
        let pipeline = TaskPipeline::new(
            Arc::new(stub),
            PipelineConfig::default().with_task_timeout(Duration::from_secs(2)),
        );
        let id = pipeline.submit(TaskSpec::new("su2", "case.cfg")).unwrap();
        let task = pipeline.wait(id, Duration::from_secs(60)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_events() {
        let sink = Arc::new(InMemoryEventSink::new());
        let pipeline = pipeline(StubExecutor::new(["fenics"])).with_event_sink(sink.clone());

        let id = pipeline.submit(TaskSpec::new("fenics", "fem_solve.py")).unwrap();
        pipeline.wait(id, Duration::from_secs(5)).await.unwrap();
        // task_finished is emitted right after the terminal snapshot
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.names().await, vec!["task_submitted", "task_finished"]);
    }
}
