//! Conductor state machine
//!
//! One decision loop per workflow:
//!
//! ```text
//! analyze -> delegate -> execute:<role>* -> join -> validate
//!     -> aggregate -> done (completed)
//!     -> handle_error -> delegate | done (failed)
//! ```
//!
//! Every transition is chosen by the [`WorkflowRouter`]; the conductor only
//! executes nodes, records their results and applies the state updates that
//! decisions carry. Execute branches run concurrently in a `JoinSet` and are
//! joined after every branch event.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use simflow_core::serde_helpers::{duration_millis, option_duration_millis};
use simflow_core::{
    emit_or_warn, EventSink, NodeError, NoopEventSink, OrchestrationEvent, TaskStatus,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::classify::Classifier;
use super::performer::{Performer, PerformerContext, PerformerOutcome, PerformerRegistry};
use super::plan::{DelegatedTask, WorkflowPlan};
use super::validator::{BranchResult, ValidationReport, Validator};
use crate::error::ConductorError;
use crate::pipeline::{FailurePolicy, TaskPipeline};
use crate::reliability::CircuitState;
use crate::routing::{
    BranchRule, CapacityProvider, DecisionReason, ExecutionState, MetricsStore, NodeErrorRecord,
    NodeResult, NodeStatus, Predicate, RoutingDecision, StateUpdate, StaticCapacity,
    WorkflowRouter,
};

/// Node names of the conductor graph
pub mod nodes {
    pub const ANALYZE: &str = "analyze";
    pub const DELEGATE: &str = "delegate";
    pub const JOIN: &str = "join";
    pub const VALIDATE: &str = "validate";
    pub const AGGREGATE: &str = "aggregate";
    pub const HANDLE_ERROR: &str = "handle_error";
    pub const DONE: &str = "done";
    /// Pseudo-node for workflow-level errors (cancellation, timeout)
    pub const WORKFLOW: &str = "workflow";
}

use nodes::*;

/// Context keys read by the conditional transitions
pub const VALIDATION_PASSED: &str = "validation_passed";
pub const ITERATIONS_REMAINING: &str = "iterations_remaining";

const REDUCED_SUFFIX: &str = ":reduced";

/// Conductor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Refinement budget; iterations are counted from 1
    pub max_iterations: u32,

    /// Wall-clock budget for a whole workflow
    #[serde(default, with = "option_duration_millis")]
    pub workflow_timeout: Option<Duration>,

    /// How long a performer waits for one job
    #[serde(with = "duration_millis")]
    pub task_wait_timeout: Duration,

    /// Join policy for execute branches
    #[serde(default)]
    pub join_policy: FailurePolicy,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            workflow_timeout: None,
            task_wait_timeout: Duration::from_secs(3600),
            join_policy: FailurePolicy::Strict,
        }
    }
}

impl ConductorConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = Some(timeout);
        self
    }

    pub fn with_task_wait_timeout(mut self, timeout: Duration) -> Self {
        self.task_wait_timeout = timeout;
        self
    }

    pub fn with_join_policy(mut self, policy: FailurePolicy) -> Self {
        self.join_policy = policy;
        self
    }
}

/// Input of [`Conductor::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Free-text description of the simulation campaign
    pub request: String,

    /// Overrides [`ConductorConfig::max_iterations`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl WorkflowRequest {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Completed,
    Failed,
}

/// Final result of a workflow
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    /// Iterations executed, at most the configured budget
    pub iterations: u32,
    /// Aggregated payload; present only when completed
    pub final_result: Option<Value>,
    /// Every node-level error in observation order, even on success
    pub errors: Vec<NodeErrorRecord>,
    /// Final execution state
    pub state: ExecutionState,
}

impl WorkflowOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// Handle to a workflow running on its own task
#[derive(Debug)]
pub struct WorkflowHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<WorkflowOutcome, ConductorError>>,
}

impl WorkflowHandle {
    /// Request cancellation; outstanding jobs are cancelled and the workflow
    /// finishes as failed
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the workflow to finish
    pub async fn join(self) -> Result<WorkflowOutcome, ConductorError> {
        self.join
            .await
            .map_err(|e| ConductorError::Join(e.to_string()))?
    }
}

/// Terminal report of one execute attempt
struct BranchDone {
    node: String,
    performer: String,
    attempt: u32,
    reduced: bool,
    outcome: PerformerOutcome,
}

/// How the execute phase ended
enum ExecutePhase {
    /// Join decision once every branch is terminal
    Joined(RoutingDecision),
    /// Workflow-level failure; all branches were cancelled and drained
    Aborted(NodeError),
}

/// What woke the join loop
enum Wake {
    Cancelled,
    DeadlineReached,
    Branch(Option<Result<BranchDone, tokio::task::JoinError>>),
}

/// Per-iteration bookkeeping for execute branches
struct Branches {
    tasks: HashMap<String, DelegatedTask>,
    tokens: HashMap<String, CancellationToken>,
    attempts: HashMap<String, u32>,
    running: JoinSet<BranchDone>,
}

impl Branches {
    fn cancel_all(&self) {
        for token in self.tokens.values() {
            token.cancel();
        }
    }
}

/// Plans, delegates, validates and aggregates simulation workflows
pub struct Conductor {
    router: WorkflowRouter,
    metrics: Arc<MetricsStore>,
    capacity: Arc<dyn CapacityProvider>,
    classifier: Classifier,
    performers: PerformerRegistry,
    validator: Validator,
    sink: Arc<dyn EventSink>,
    config: ConductorConfig,
}

impl Conductor {
    /// Conductor over the given performers with default collaborators
    pub fn new(performers: PerformerRegistry) -> Self {
        Self {
            router: WorkflowRouter::default(),
            metrics: Arc::new(MetricsStore::new()),
            capacity: Arc::new(StaticCapacity::unlimited()),
            classifier: Classifier::default(),
            performers,
            validator: Validator::default(),
            sink: Arc::new(NoopEventSink),
            config: ConductorConfig::default(),
        }
    }

    /// Conductor with the standard performers on `pipeline`
    pub fn with_pipeline(pipeline: Arc<TaskPipeline>) -> Self {
        Self::new(PerformerRegistry::defaults(pipeline))
    }

    pub fn with_router(mut self, router: WorkflowRouter) -> Self {
        self.router = router;
        self
    }

    /// Share a metrics store across conductors
    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_capacity(mut self, capacity: Arc<dyn CapacityProvider>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config(mut self, config: ConductorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn router(&self) -> &WorkflowRouter {
        &self.router
    }

    /// Classify a request into a plan
    pub fn analyze(
        &self,
        workflow_id: Uuid,
        request: &str,
        max_iterations: u32,
    ) -> Result<WorkflowPlan, ConductorError> {
        if max_iterations == 0 {
            return Err(ConductorError::invalid_plan(
                "max_iterations must be at least 1",
            ));
        }

        let roles = self.classifier.classify(request);
        if roles.is_empty() {
            return Err(ConductorError::NoMatch(request.to_string()));
        }
        if let Some(role) = roles.iter().find(|role| !self.performers.has_role(**role)) {
            return Err(ConductorError::invalid_plan(format!(
                "no performer registered for role {role}"
            )));
        }

        Ok(WorkflowPlan::new(workflow_id, request, roles))
    }

    /// Run a workflow to completion
    pub async fn run(&self, request: WorkflowRequest) -> Result<WorkflowOutcome, ConductorError> {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run a workflow on its own task
    pub fn spawn(self: &Arc<Self>, request: WorkflowRequest) -> WorkflowHandle {
        let cancel = CancellationToken::new();
        let conductor = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { conductor.run_with_cancel(request, token).await });
        WorkflowHandle { cancel, join }
    }

    /// Run a workflow until it finishes or `cancel` fires
    ///
    /// Only workflow-definition errors are returned as `Err`; everything that
    /// happens during execution ends up in the outcome.
    #[instrument(skip(self, request, cancel), fields(workflow_id))]
    pub async fn run_with_cancel(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome, ConductorError> {
        let workflow_id = Uuid::now_v7();
        tracing::Span::current().record("workflow_id", tracing::field::display(workflow_id));

        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        let mut plan = self.analyze(workflow_id, &request.request, max_iterations)?;

        info!(roles = ?plan.roles(), max_iterations, "workflow started");
        self.emit(OrchestrationEvent::workflow_started(
            workflow_id,
            &request.request,
            max_iterations,
        ))
        .await;

        let mut state = ExecutionState::new(workflow_id);
        self.enter(&state, ANALYZE).await;
        state.set_status(ANALYZE, NodeStatus::Success);
        state.set_context("roles", json!(plan.roles()));
        let decision = self.router.success_path(&state, ANALYZE, DELEGATE, DONE);
        self.apply_decision(&mut state, ANALYZE, &decision).await;

        let deadline = self.config.workflow_timeout.map(|t| Instant::now() + t);

        loop {
            let iteration = state.begin_iteration();
            self.enter(&state, DELEGATE).await;
            let tasks = plan.delegate().to_vec();
            for task in &tasks {
                state.reset_node(&task.node);
            }
            debug!(iteration, revision = plan.revision(), "plan delegated");

            let joined = match self.execute(&mut state, &tasks, &cancel, deadline).await {
                ExecutePhase::Joined(decision) => decision,
                ExecutePhase::Aborted(error) => {
                    warn!(iteration, error = %error, "workflow aborted");
                    state.record_error(WORKFLOW, 0, error);
                    return Ok(self.finish(state, WorkflowStatus::Failed, None).await);
                }
            };

            let results: Vec<BranchResult> = tasks
                .iter()
                .map(|task| BranchResult {
                    node: task.node.clone(),
                    role: task.role,
                    status: state.status(&task.node),
                    result: state.result(&task.node).cloned(),
                })
                .collect();
            let report = self.validator.validate(&results);

            let next = if joined.target() == Some(VALIDATE) {
                self.validate(&mut state, &report).await
            } else {
                // Strict join failure skips validation; the report still
                // carries feedback for the failed branches
                state.set_context(VALIDATION_PASSED, false);
                HANDLE_ERROR
            };

            if next == AGGREGATE {
                self.enter(&state, AGGREGATE).await;
                let result = self.aggregate(&plan, &state, &report);
                return Ok(self
                    .finish(state, WorkflowStatus::Completed, Some(result))
                    .await);
            }

            self.enter(&state, HANDLE_ERROR).await;
            state.set_context(ITERATIONS_REMAINING, max_iterations.saturating_sub(iteration));
            let decision = self.router.conditional(
                &state,
                &[BranchRule::new(
                    ITERATIONS_REMAINING,
                    Predicate::GreaterThan(0.0),
                    DELEGATE,
                )],
                DONE,
            );
            self.apply_decision(&mut state, HANDLE_ERROR, &decision).await;

            if decision.target() != Some(DELEGATE) {
                info!(iteration, "refinement budget exhausted");
                return Ok(self.finish(state, WorkflowStatus::Failed, None).await);
            }

            let applied = plan.apply_feedback(&report.feedback);
            info!(
                iteration,
                feedback = report.feedback.len(),
                applied,
                "refining plan"
            );
        }
    }

    /// Record the validation verdict and route on it
    async fn validate(&self, state: &mut ExecutionState, report: &ValidationReport) -> &'static str {
        self.enter(state, VALIDATE).await;

        // Failed branches already recorded their own errors
        for failure in &report.errors {
            if state.status(&failure.node) == NodeStatus::Success {
                state.record_error(&failure.node, 0, failure.error.clone());
            }
        }
        state.set_context(VALIDATION_PASSED, report.passed);
        state.set_context("validation_errors", report.errors.len());

        let decision = self.router.conditional(
            state,
            &[BranchRule::new(
                VALIDATION_PASSED,
                Predicate::Equals(json!(true)),
                AGGREGATE,
            )],
            HANDLE_ERROR,
        );
        self.apply_decision(state, VALIDATE, &decision).await;

        if decision.target() == Some(AGGREGATE) {
            AGGREGATE
        } else {
            HANDLE_ERROR
        }
    }

    /// Merge performer outputs with the validation verdict
    pub fn aggregate(
        &self,
        plan: &WorkflowPlan,
        state: &ExecutionState,
        report: &ValidationReport,
    ) -> Value {
        let roles: Vec<Value> = plan
            .tasks()
            .iter()
            .map(|task| {
                let result = state.result(&task.node);
                json!({
                    "role": task.role,
                    "node": task.node,
                    "performer": result.and_then(|r| r.performer.clone()),
                    "task_id": result.and_then(|r| r.task_id),
                    "elapsed_ms": result.map(|r| r.elapsed.as_millis() as u64),
                    "reduced": result.is_some_and(|r| r.reduced),
                    "output": result.and_then(|r| r.output.clone()),
                })
            })
            .collect();

        json!({
            "workflow_id": plan.workflow_id,
            "request": plan.request,
            "iterations": state.iteration(),
            "revision": plan.revision(),
            "roles": roles,
            "validation": {
                "passed": report.passed,
                "checked": report.checked,
            },
        })
    }

    // ========================================================================
    // Execute phase
    // ========================================================================

    async fn execute(
        &self,
        state: &mut ExecutionState,
        tasks: &[DelegatedTask],
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> ExecutePhase {
        let nodes: Vec<String> = tasks.iter().map(|t| t.node.clone()).collect();
        let fan_out = self.router.fan_out(&nodes);
        self.apply_decision(state, DELEGATE, &fan_out).await;

        let mut branches = Branches {
            tasks: tasks.iter().map(|t| (t.node.clone(), t.clone())).collect(),
            tokens: HashMap::new(),
            attempts: HashMap::new(),
            running: JoinSet::new(),
        };
        for node in fan_out.next() {
            branches.tokens.insert(node.clone(), cancel.child_token());
            self.launch(state, &mut branches, node, None, false).await;
        }

        loop {
            let join = self.router.join(
                state,
                &nodes,
                self.config.join_policy,
                VALIDATE,
                HANDLE_ERROR,
            );
            if !join.is_wait() {
                self.apply_decision(state, JOIN, &join).await;
                return ExecutePhase::Joined(join);
            }
            if join.reason() == DecisionReason::JoinShortCircuit {
                let mut newly_cancelled = false;
                for node in join.cancellations() {
                    if let Some(token) = branches.tokens.get(node) {
                        if !token.is_cancelled() {
                            token.cancel();
                            newly_cancelled = true;
                        }
                    }
                }
                if newly_cancelled {
                    self.apply_decision(state, JOIN, &join).await;
                }
            }

            let deadline_reached = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = deadline_reached => Wake::DeadlineReached,
                joined = branches.running.join_next() => Wake::Branch(joined),
            };

            match wake {
                Wake::Cancelled => {
                    return self
                        .abort(state, branches, NodeError::cancelled("workflow cancelled"))
                        .await;
                }
                Wake::DeadlineReached => {
                    let budget = self.config.workflow_timeout.unwrap_or_default();
                    let error = NodeError::timeout(format!("workflow timed out after {budget:?}"));
                    return self.abort(state, branches, error).await;
                }
                Wake::Branch(Some(Ok(done))) => {
                    self.on_branch_done(state, &mut branches, done).await;
                }
                Wake::Branch(Some(Err(e))) => {
                    warn!(error = %e, "execute branch task failed");
                }
                Wake::Branch(None) => {
                    // Join still waiting but nothing left to wait on
                    let error = NodeError::critical("join has pending branches but none running");
                    return self.abort(state, branches, error).await;
                }
            }
        }
    }

    /// Start one attempt of `node`: breaker gate, performer selection,
    /// capacity check, then spawn
    async fn launch(
        &self,
        state: &mut ExecutionState,
        branches: &mut Branches,
        node: &str,
        delay: Option<Duration>,
        force_reduced: bool,
    ) {
        let Some(task) = branches.tasks.get(node).cloned() else {
            warn!(node, "no delegated task for node");
            return;
        };
        let attempt = {
            let counter = branches.attempts.entry(node.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.enter(state, node).await;

        let gate = self.router.breaker_gate(state, node, JOIN, Utc::now());
        self.apply_decision(state, node, &gate).await;
        if gate.reason() == DecisionReason::BreakerOpen {
            let breaker = state.breaker(node);
            let error = NodeError::execution(format!("circuit breaker open for {node}"))
                .with_details(json!({
                    "breaker": breaker.state.to_string(),
                    "consecutive_failures": breaker.consecutive_failures,
                }));
            self.fail_without_attempt(state, node, attempt, error);
            return;
        }

        let candidates: Vec<&str> = self
            .performers
            .candidates(task.role)
            .iter()
            .map(|p| p.name())
            .collect();
        let selection = self.router.select_by_performance(&candidates, &self.metrics);
        self.apply_decision(state, node, &selection).await;
        let performer = match selection
            .target()
            .and_then(|name| self.performers.get(task.role, name))
        {
            Some(performer) => performer,
            None => {
                let error = NodeError::critical(format!("no performer for role {}", task.role));
                self.fail_without_attempt(state, node, attempt, error);
                return;
            }
        };

        let reduced = if force_reduced {
            true
        } else {
            let fallback = format!("{node}{REDUCED_SUFFIX}");
            let placement = self.router.resource_aware(
                &performer.resources(),
                self.capacity.as_ref(),
                node,
                &fallback,
            );
            self.apply_decision(state, node, &placement).await;
            placement.reason() == DecisionReason::InsufficientResources
        };

        let Some(token) = branches.tokens.get(node).cloned() else {
            warn!(node, "no cancellation token for node");
            return;
        };
        let ctx = PerformerContext {
            workflow_id: state.workflow_id(),
            node: node.to_string(),
            attempt,
            reduced,
            wait_timeout: self.config.task_wait_timeout,
            cancel: token,
        };
        let delay = delay.map(|d| self.router.backoff().jittered(d));

        state.set_status(node, NodeStatus::Running);
        debug!(node, performer = performer.name(), attempt, reduced, ?delay, "launching branch");
        branches
            .running
            .spawn(run_branch(performer, task, ctx, delay));
    }

    fn fail_without_attempt(
        &self,
        state: &mut ExecutionState,
        node: &str,
        attempt: u32,
        error: NodeError,
    ) {
        state.record_result(
            node,
            NodeResult {
                error: Some(error.clone()),
                attempt,
                ..Default::default()
            },
        );
        state.set_status(node, NodeStatus::Failure);
        state.record_error(node, attempt, error);
    }

    /// Record a finished attempt and route it through the breaker-wrapped
    /// retry router
    async fn on_branch_done(&self, state: &mut ExecutionState, branches: &mut Branches, done: BranchDone) {
        let BranchDone {
            node,
            performer,
            attempt,
            reduced,
            outcome,
        } = done;

        if outcome.status != TaskStatus::Cancelled {
            self.metrics
                .record(&performer, outcome.is_success(), outcome.elapsed);
        }
        debug!(node = %node, performer = %performer, status = %outcome.status, attempt, "branch finished");

        self.record_outcome(state, &node, performer, attempt, reduced, outcome);

        // Short-circuited siblings are not routed
        if branches
            .tokens
            .get(&node)
            .is_some_and(CancellationToken::is_cancelled)
        {
            self.release_breaker(state, &node).await;
            return;
        }

        let fallback = format!("{node}{REDUCED_SUFFIX}");
        let fallback = (!reduced).then_some(fallback.as_str());
        let decision = self
            .router
            .circuit_breaker(state, &node, JOIN, JOIN, fallback, Utc::now());
        self.apply_decision(state, &node, &decision).await;

        match decision.target() {
            Some(target) if target == node => {
                state.set_status(&node, NodeStatus::Pending);
                self.launch(state, branches, &node, decision.delay(), reduced)
                    .await;
            }
            Some(target) if Some(target) == fallback => {
                state.set_status(&node, NodeStatus::Pending);
                self.launch(state, branches, &node, None, true).await;
            }
            _ => {}
        }
    }

    fn record_outcome(
        &self,
        state: &mut ExecutionState,
        node: &str,
        performer: String,
        attempt: u32,
        reduced: bool,
        outcome: PerformerOutcome,
    ) {
        if let (false, Some(error)) = (outcome.is_success(), outcome.error.clone()) {
            state.record_error(node, attempt, error);
        }
        state.record_result(
            node,
            NodeResult {
                performer: Some(performer),
                task_id: outcome.task_id,
                output: outcome.output,
                error: outcome.error,
                elapsed: outcome.elapsed,
                attempt,
                reduced,
            },
        );
        state.set_status(node, outcome.status);
    }

    /// Cancel every branch, wait for the acknowledgements and record them
    async fn abort(
        &self,
        state: &mut ExecutionState,
        mut branches: Branches,
        error: NodeError,
    ) -> ExecutePhase {
        branches.cancel_all();
        while let Some(joined) = branches.running.join_next().await {
            match joined {
                Ok(done) => {
                    self.record_outcome(
                        state,
                        &done.node,
                        done.performer,
                        done.attempt,
                        done.reduced,
                        done.outcome,
                    );
                    self.release_breaker(state, &done.node).await;
                }
                Err(e) => warn!(error = %e, "execute branch task failed during abort"),
            }
        }
        ExecutePhase::Aborted(error)
    }

    /// Reopen the breaker of a node whose half-open attempt was cancelled
    async fn release_breaker(&self, state: &mut ExecutionState, node: &str) {
        if let Some(decision) = self.router.release_breaker(state, node, JOIN) {
            debug!(node, "cancelled half-open attempt; breaker reopened");
            self.apply_decision(state, node, &decision).await;
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    async fn emit(&self, event: OrchestrationEvent) {
        emit_or_warn(self.sink.as_ref(), event).await;
    }

    async fn enter(&self, state: &ExecutionState, node: &str) {
        debug!(node, iteration = state.iteration(), "entering node");
        self.emit(OrchestrationEvent::node_entered(
            state.workflow_id(),
            node,
            state.iteration(),
        ))
        .await;
    }

    /// Apply a decision's updates and emit the events it implies
    async fn apply_decision(&self, state: &mut ExecutionState, from: &str, decision: &RoutingDecision) {
        let workflow_id = state.workflow_id();
        let before: Vec<_> = decision
            .updates()
            .iter()
            .filter_map(|update| match update {
                StateUpdate::Breaker { node, .. } => Some((node.clone(), state.breaker(node))),
                _ => None,
            })
            .collect();

        state.apply(decision);

        for (node, previous) in before {
            let current = state.breaker(&node);
            if previous.state == current.state {
                continue;
            }
            let event = match current.state {
                CircuitState::Open => {
                    warn!(node = %node, failures = current.consecutive_failures, "circuit breaker opened");
                    OrchestrationEvent::breaker_opened(workflow_id, &node, current.consecutive_failures)
                }
                CircuitState::HalfOpen => OrchestrationEvent::breaker_half_opened(workflow_id, &node),
                CircuitState::Closed => OrchestrationEvent::breaker_closed(workflow_id, &node),
            };
            self.emit(event).await;
        }

        if decision.reason() == DecisionReason::Retry {
            let attempt = decision
                .metadata()
                .get("attempt")
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32;
            let delay = decision.delay().unwrap_or_default();
            info!(node = from, attempt, ?delay, "retrying node");
            self.emit(OrchestrationEvent::retry_attempted(
                workflow_id,
                from,
                attempt,
                delay,
            ))
            .await;
        }

        self.emit(OrchestrationEvent::decision_made(
            workflow_id,
            from,
            decision.next().to_vec(),
            decision.reason().as_str(),
        ))
        .await;
    }

    async fn finish(
        &self,
        state: ExecutionState,
        status: WorkflowStatus,
        final_result: Option<Value>,
    ) -> WorkflowOutcome {
        let workflow_id = state.workflow_id();
        let iterations = state.iteration();
        self.enter(&state, DONE).await;

        let event = match status {
            WorkflowStatus::Completed => {
                info!(iterations, errors = state.errors().len(), "workflow completed");
                OrchestrationEvent::workflow_completed(workflow_id, iterations)
            }
            WorkflowStatus::Failed => {
                warn!(iterations, errors = state.errors().len(), "workflow failed");
                OrchestrationEvent::workflow_failed(workflow_id, iterations, state.errors().len())
            }
        };
        self.emit(event).await;

        WorkflowOutcome {
            workflow_id,
            status,
            iterations,
            final_result,
            errors: state.errors().to_vec(),
            state,
        }
    }
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("router", &self.router)
            .field("classifier", &self.classifier)
            .field("performers", &self.performers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One attempt of an execute branch, run on the branch's own task
async fn run_branch(
    performer: Arc<dyn Performer>,
    task: DelegatedTask,
    ctx: PerformerContext,
    delay: Option<Duration>,
) -> BranchDone {
    let name = performer.name().to_string();
    let done = |outcome: PerformerOutcome| BranchDone {
        node: ctx.node.clone(),
        performer: name.clone(),
        attempt: ctx.attempt,
        reduced: ctx.reduced,
        outcome,
    };

    if let Some(delay) = delay {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return done(PerformerOutcome::failed(
                    &name,
                    None,
                    NodeError::cancelled("cancelled during retry backoff"),
                    Duration::ZERO,
                ));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let outcome = AssertUnwindSafe(performer.execute_task(&task, &ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "performer panicked".to_string());
            PerformerOutcome::failed(&name, None, NodeError::critical(message), Duration::ZERO)
        });
    done(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::classify::Role;
    use crate::executor::StubExecutor;
    use crate::pipeline::PipelineConfig;

    fn conductor() -> Conductor {
        let stub = StubExecutor::new(["fenics", "lammps", "gromacs", "openfoam", "su2"]);
        let pipeline = Arc::new(TaskPipeline::new(Arc::new(stub), PipelineConfig::default()));
        Conductor::with_pipeline(pipeline)
    }

    #[test]
    fn test_analyze_orders_roles_by_rule_table() {
        let plan = conductor()
            .analyze(Uuid::now_v7(), "CFD airflow over a beam with stress analysis", 3)
            .unwrap();
        assert_eq!(plan.roles(), [Role::Structural, Role::Cfd]);
    }

    #[test]
    fn test_analyze_rejects_unmatched_request() {
        let err = conductor()
            .analyze(Uuid::now_v7(), "bake a cake", 3)
            .unwrap_err();
        assert!(matches!(err, ConductorError::NoMatch(_)));
    }

    #[test]
    fn test_analyze_rejects_zero_iterations() {
        let err = conductor()
            .analyze(Uuid::now_v7(), "cfd run", 0)
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidPlan(_)));
    }

    #[test]
    fn test_analyze_requires_performer_per_role() {
        let conductor = Conductor::new(PerformerRegistry::new());
        let err = conductor
            .analyze(Uuid::now_v7(), "protein folding md", 3)
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidPlan(msg) if msg.contains("molecular_dynamics")));
    }

    #[test]
    fn test_aggregate_shape() {
        let conductor = conductor();
        let mut plan = conductor
            .analyze(Uuid::now_v7(), "turbulence model", 3)
            .unwrap();
        plan.delegate();
        let mut state = ExecutionState::new(plan.workflow_id);
        state.begin_iteration();
        state.record_result(
            "execute:cfd",
            NodeResult {
                performer: Some("cfd.openfoam".to_string()),
                output: Some(json!({"residual": 1e-6})),
                attempt: 1,
                ..Default::default()
            },
        );
        let report = ValidationReport {
            passed: true,
            checked: 1,
            ..Default::default()
        };

        let result = conductor.aggregate(&plan, &state, &report);
        assert_eq!(result["iterations"], 1);
        assert_eq!(result["roles"][0]["role"], "cfd");
        assert_eq!(result["roles"][0]["performer"], "cfd.openfoam");
        assert_eq!(result["roles"][0]["reduced"], false);
        assert_eq!(result["validation"]["passed"], true);
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let config = ConductorConfig::default()
            .with_workflow_timeout(Duration::from_secs(2))
            .with_join_policy(FailurePolicy::Tolerant);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["workflow_timeout"], 2000);
        assert_eq!(json["task_wait_timeout"], 3_600_000);
        assert_eq!(json["join_policy"], "tolerant");

        let parsed: ConductorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
