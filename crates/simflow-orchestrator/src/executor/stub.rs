//! Scripted executor for tests and demos

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use simflow_core::{NodeError, TaskSpec};

use super::{JobContext, TaskExecutor};

/// Scripted result of one stub job
#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Succeed with the given payload
    Succeed(Value),
    /// Succeed with `{tool, script, params}` of the job
    Echo,
    /// Fail with the given error
    Fail(NodeError),
    /// Sleep, then resolve the inner outcome
    Delay(Duration, Box<StubOutcome>),
    /// Never finish on its own; only cancellation ends the job
    Hang,
}

impl StubOutcome {
    pub fn succeed(payload: Value) -> Self {
        StubOutcome::Succeed(payload)
    }

    pub fn fail(error: NodeError) -> Self {
        StubOutcome::Fail(error)
    }

    /// Resolve `self` after `delay`
    pub fn after(self, delay: Duration) -> Self {
        StubOutcome::Delay(delay, Box::new(self))
    }
}

/// In-memory executor with per-tool scripted outcomes
///
/// Outcomes are resolved in this order:
/// 1. Next queued outcome for the tool (see [`StubExecutor::push_outcome`])
/// 2. Default outcome for the tool
/// 3. Executor-wide fallback (`Echo` unless overridden)
#[derive(Debug)]
pub struct StubExecutor {
    tools: Vec<String>,
    defaults: HashMap<String, StubOutcome>,
    fallback: StubOutcome,
    queued: Mutex<HashMap<String, VecDeque<StubOutcome>>>,
    calls: Mutex<Vec<TaskSpec>>,
}

impl StubExecutor {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            defaults: HashMap::new(),
            fallback: StubOutcome::Echo,
            queued: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Default outcome for every job of `tool`
    pub fn with_default(mut self, tool: impl Into<String>, outcome: StubOutcome) -> Self {
        self.defaults.insert(tool.into(), outcome);
        self
    }

    /// Outcome for tools without a default
    pub fn with_fallback(mut self, outcome: StubOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Queue an outcome consumed by the next job of `tool`
    pub fn push_outcome(&self, tool: impl Into<String>, outcome: StubOutcome) {
        self.queued
            .lock()
            .entry(tool.into())
            .or_default()
            .push_back(outcome);
    }

    /// Every job started so far, in start order
    pub fn calls(&self) -> Vec<TaskSpec> {
        self.calls.lock().clone()
    }

    /// Number of jobs started for `tool`
    pub fn call_count(&self, tool: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.tool == tool).count()
    }

    fn next_outcome(&self, tool: &str) -> StubOutcome {
        if let Some(outcome) = self.queued.lock().get_mut(tool).and_then(VecDeque::pop_front) {
            return outcome;
        }
        self.defaults
            .get(tool)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl TaskExecutor for StubExecutor {
    fn capabilities(&self) -> Vec<String> {
        self.tools.clone()
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, NodeError> {
        self.calls.lock().push(TaskSpec {
            tool: ctx.tool.clone(),
            script: ctx.script.clone(),
            params: ctx.params.clone(),
        });

        let mut outcome = self.next_outcome(&ctx.tool);
        loop {
            match outcome {
                StubOutcome::Succeed(payload) => return Ok(payload),
                StubOutcome::Echo => {
                    return Ok(json!({
                        "tool": ctx.tool,
                        "script": ctx.script,
                        "params": ctx.params,
                    }))
                }
                StubOutcome::Fail(error) => return Err(error),
                StubOutcome::Delay(delay, inner) => {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(NodeError::cancelled("stub job cancelled")),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    ctx.report_progress(0.5);
                    outcome = *inner;
                }
                StubOutcome::Hang => {
                    ctx.cancelled().await;
                    return Err(NodeError::cancelled("stub job cancelled"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflow_core::{ErrorKind, Task};
    use tokio_util::sync::CancellationToken;

    fn ctx(tool: &str) -> JobContext {
        JobContext::new(
            &Task::new(TaskSpec::new(tool, "run").with_param("n", 1)),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_queued_outcomes_take_precedence() {
        let stub = StubExecutor::new(["fenics"])
            .with_default("fenics", StubOutcome::succeed(json!({"default": true})));
        stub.push_outcome("fenics", StubOutcome::fail(NodeError::execution("diverged")));

        let first = stub.execute(ctx("fenics")).await;
        assert_eq!(first.unwrap_err().kind, ErrorKind::Execution);

        let second = stub.execute(ctx("fenics")).await.unwrap();
        assert_eq!(second, json!({"default": true}));
        assert_eq!(stub.call_count("fenics"), 2);
    }

    #[tokio::test]
    async fn test_echo_returns_job_description() {
        let stub = StubExecutor::new(["lammps"]);
        let result = stub.execute(ctx("lammps")).await.unwrap();
        assert_eq!(result["tool"], "lammps");
        assert_eq!(result["params"]["n"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_then_resolve() {
        let stub = StubExecutor::new(["su2"]).with_fallback(
            StubOutcome::succeed(json!({"ok": true})).after(Duration::from_secs(30)),
        );
        let result = stub.execute(ctx("su2")).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_hang_ends_on_cancel() {
        let stub = StubExecutor::new(["openfoam"]).with_fallback(StubOutcome::Hang);
        let token = CancellationToken::new();
        let ctx = JobContext::new(&Task::new(TaskSpec::new("openfoam", "x")), token.clone());

        let handle = tokio::spawn(async move { stub.execute(ctx).await });
        token.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
    }
}
