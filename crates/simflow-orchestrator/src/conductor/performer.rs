//! Performers: domain executors that run delegated tasks on the pipeline

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use simflow_core::serde_helpers::duration_millis;
use simflow_core::{NodeError, Task, TaskId, TaskParams, TaskSpec, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::classify::Role;
use super::plan::DelegatedTask;
use super::validator::Adjustment;
use crate::error::PipelineError;
use crate::pipeline::TaskPipeline;
use crate::routing::ResourceRequirement;

/// How long to wait for a cancelled job to acknowledge
const CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt context handed to a performer
#[derive(Debug, Clone)]
pub struct PerformerContext {
    pub workflow_id: Uuid,
    pub node: String,
    /// 1-based attempt within the current iteration
    pub attempt: u32,
    /// Run with reduced resource parameters
    pub reduced: bool,
    /// Budget for waiting on the submitted job
    pub wait_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Result of one performer attempt; failures are values, never errors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformerOutcome {
    pub performer: String,
    pub task_id: Option<TaskId>,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<NodeError>,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl PerformerOutcome {
    pub fn from_task(performer: impl Into<String>, task: &Task, elapsed: Duration) -> Self {
        Self {
            performer: performer.into(),
            task_id: Some(task.id),
            status: task.status,
            output: task.result.clone(),
            error: task.error.clone(),
            elapsed: task.elapsed().unwrap_or(elapsed),
        }
    }

    pub fn failed(
        performer: impl Into<String>,
        task_id: Option<TaskId>,
        error: NodeError,
        elapsed: Duration,
    ) -> Self {
        let status = if error.kind == simflow_core::ErrorKind::Cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failure
        };
        Self {
            performer: performer.into(),
            task_id,
            status,
            output: None,
            error: Some(error),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Domain executor for one role
#[async_trait]
pub trait Performer: Send + Sync {
    /// Unique name, also the key for execution metrics
    fn name(&self) -> &str;

    fn role(&self) -> Role;

    /// Resources a normal run needs
    fn resources(&self) -> ResourceRequirement;

    /// Parameters for a run under reduced resources
    fn reduced_params(&self, params: &TaskParams) -> TaskParams;

    /// Run a delegated task to a terminal outcome
    async fn execute_task(&self, task: &DelegatedTask, ctx: &PerformerContext) -> PerformerOutcome;
}

/// Shared plumbing: submit a job to the pipeline and wait for it
#[derive(Debug, Clone)]
pub struct PipelinePerformer {
    name: String,
    role: Role,
    tool: String,
    script: Option<String>,
    resources: ResourceRequirement,
    pipeline: Arc<TaskPipeline>,
}

impl PipelinePerformer {
    pub fn new(
        name: impl Into<String>,
        role: Role,
        tool: impl Into<String>,
        resources: ResourceRequirement,
        pipeline: Arc<TaskPipeline>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            tool: tool.into(),
            script: None,
            resources,
            pipeline,
        }
    }

    /// Replace the role's default script
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Job spec for a delegated task
    pub fn prepare(&self, task: &DelegatedTask, params: TaskParams) -> TaskSpec {
        TaskSpec {
            tool: self.tool.clone(),
            script: self.script.clone().unwrap_or_else(|| task.spec.script.clone()),
            params,
        }
    }

    /// Submit `spec` and wait for a terminal outcome
    pub async fn run(&self, spec: TaskSpec, ctx: &PerformerContext) -> PerformerOutcome {
        let started = Instant::now();
        let task_id = match self.pipeline.submit(spec) {
            Ok(id) => id,
            Err(e) => {
                return PerformerOutcome::failed(&self.name, None, e.into_node_error(), started.elapsed())
            }
        };
        debug!(performer = %self.name, node = %ctx.node, %task_id, attempt = ctx.attempt, "job submitted");

        let waited = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                self.cancel_job(task_id);
                self.pipeline.wait(task_id, CANCEL_ACK_TIMEOUT).await
            }
            result = self.pipeline.wait(task_id, ctx.wait_timeout) => result,
        };

        let outcome = match waited {
            Ok(task) => PerformerOutcome::from_task(&self.name, &task, started.elapsed()),
            Err(PipelineError::Timeout { waited, .. }) if ctx.cancel.is_cancelled() => {
                warn!(performer = %self.name, %task_id, ?waited, "cancelled job did not acknowledge");
                PerformerOutcome::failed(
                    &self.name,
                    Some(task_id),
                    NodeError::cancelled("workflow cancelled"),
                    started.elapsed(),
                )
            }
            Err(e @ PipelineError::Timeout { .. }) => {
                // Abandoning the wait; free the executor slot as well
                self.cancel_job(task_id);
                if let Err(ack) = self.pipeline.wait(task_id, CANCEL_ACK_TIMEOUT).await {
                    warn!(performer = %self.name, %task_id, error = %ack, "timed out job did not acknowledge");
                }
                PerformerOutcome::failed(&self.name, Some(task_id), e.into_node_error(), started.elapsed())
            }
            Err(e) => {
                PerformerOutcome::failed(&self.name, Some(task_id), e.into_node_error(), started.elapsed())
            }
        };

        // The outcome carries everything callers need from the task
        if self.pipeline.forget(task_id).is_none() {
            debug!(performer = %self.name, %task_id, "job still running; left in pipeline");
        }
        outcome
    }

    fn cancel_job(&self, task_id: TaskId) {
        if let Err(e) = self.pipeline.cancel(task_id) {
            warn!(performer = %self.name, %task_id, error = %e, "failed to cancel job");
        }
    }
}

fn scale_param(params: &mut TaskParams, key: &str, factor: f64) {
    if let Some(next) = Adjustment::Scale(factor).apply(params.get(key)) {
        params.insert(key.to_string(), next);
    }
}

macro_rules! pipeline_performer {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            inner: PipelinePerformer,
        }

        impl $name {
            /// Wrap custom plumbing (alternate tool or script)
            pub fn with_plumbing(inner: PipelinePerformer) -> Self {
                Self { inner }
            }
        }
    };
}

pipeline_performer!(
    /// Finite-element structural analysis
    StructuralPerformer
);
pipeline_performer!(
    /// Molecular dynamics
    MolecularDynamicsPerformer
);
pipeline_performer!(
    /// Computational fluid dynamics
    CfdPerformer
);

impl StructuralPerformer {
    pub fn fenics(pipeline: Arc<TaskPipeline>) -> Self {
        Self::with_plumbing(PipelinePerformer::new(
            "structural.fenics",
            Role::Structural,
            "fenics",
            ResourceRequirement::new(4.0, 8_192, 0),
            pipeline,
        ))
    }
}

impl MolecularDynamicsPerformer {
    pub fn lammps(pipeline: Arc<TaskPipeline>) -> Self {
        Self::with_plumbing(PipelinePerformer::new(
            "md.lammps",
            Role::MolecularDynamics,
            "lammps",
            ResourceRequirement::new(8.0, 16_384, 1),
            pipeline,
        ))
    }

    pub fn gromacs(pipeline: Arc<TaskPipeline>) -> Self {
        Self::with_plumbing(
            PipelinePerformer::new(
                "md.gromacs",
                Role::MolecularDynamics,
                "gromacs",
                ResourceRequirement::new(8.0, 16_384, 1),
                pipeline,
            )
            .with_script("md.mdp"),
        )
    }
}

impl CfdPerformer {
    pub fn openfoam(pipeline: Arc<TaskPipeline>) -> Self {
        Self::with_plumbing(PipelinePerformer::new(
            "cfd.openfoam",
            Role::Cfd,
            "openfoam",
            ResourceRequirement::new(8.0, 32_768, 0),
            pipeline,
        ))
    }

    pub fn su2(pipeline: Arc<TaskPipeline>) -> Self {
        Self::with_plumbing(
            PipelinePerformer::new(
                "cfd.su2",
                Role::Cfd,
                "su2",
                ResourceRequirement::new(8.0, 16_384, 0),
                pipeline,
            )
            .with_script("case.cfg"),
        )
    }
}

#[async_trait]
impl Performer for StructuralPerformer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn role(&self) -> Role {
        self.inner.role()
    }

    fn resources(&self) -> ResourceRequirement {
        self.inner.resources
    }

    fn reduced_params(&self, params: &TaskParams) -> TaskParams {
        let mut params = params.clone();
        scale_param(&mut params, "cores", 0.5);
        scale_param(&mut params, "mesh_resolution", 0.5);
        params
    }

    async fn execute_task(&self, task: &DelegatedTask, ctx: &PerformerContext) -> PerformerOutcome {
        let mut params = task.spec.params.clone();
        params
            .entry("linear_solver".to_string())
            .or_insert(Value::from("mumps"));
        if ctx.reduced {
            params = self.reduced_params(&params);
        }
        self.inner.run(self.inner.prepare(task, params), ctx).await
    }
}

#[async_trait]
impl Performer for MolecularDynamicsPerformer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn role(&self) -> Role {
        self.inner.role()
    }

    fn resources(&self) -> ResourceRequirement {
        self.inner.resources
    }

    fn reduced_params(&self, params: &TaskParams) -> TaskParams {
        let mut params = params.clone();
        params.insert("gpus".to_string(), Value::from(0));
        scale_param(&mut params, "cores", 0.5);
        params
    }

    async fn execute_task(&self, task: &DelegatedTask, ctx: &PerformerContext) -> PerformerOutcome {
        let mut params = task.spec.params.clone();
        params.entry("ensemble".to_string()).or_insert(Value::from("NVT"));
        if ctx.reduced {
            params = self.reduced_params(&params);
        }
        self.inner.run(self.inner.prepare(task, params), ctx).await
    }
}

#[async_trait]
impl Performer for CfdPerformer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn role(&self) -> Role {
        self.inner.role()
    }

    fn resources(&self) -> ResourceRequirement {
        self.inner.resources
    }

    fn reduced_params(&self, params: &TaskParams) -> TaskParams {
        let mut params = params.clone();
        scale_param(&mut params, "cores", 0.5);
        scale_param(&mut params, "mesh_resolution", 0.5);
        params
    }

    async fn execute_task(&self, task: &DelegatedTask, ctx: &PerformerContext) -> PerformerOutcome {
        let mut params = task.spec.params.clone();
        params
            .entry("turbulence_model".to_string())
            .or_insert(Value::from("k-epsilon"));
        if ctx.reduced {
            params = self.reduced_params(&params);
        }
        self.inner.run(self.inner.prepare(task, params), ctx).await
    }
}

/// Ordered performer candidates per role
#[derive(Clone, Default)]
pub struct PerformerRegistry {
    by_role: BTreeMap<Role, Vec<Arc<dyn Performer>>>,
}

impl PerformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard performers for every role, preferred first
    pub fn defaults(pipeline: Arc<TaskPipeline>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StructuralPerformer::fenics(pipeline.clone())));
        registry.register(Arc::new(MolecularDynamicsPerformer::lammps(pipeline.clone())));
        registry.register(Arc::new(MolecularDynamicsPerformer::gromacs(pipeline.clone())));
        registry.register(Arc::new(CfdPerformer::openfoam(pipeline.clone())));
        registry.register(Arc::new(CfdPerformer::su2(pipeline)));
        registry
    }

    /// Append a candidate for its role
    pub fn register(&mut self, performer: Arc<dyn Performer>) -> &mut Self {
        self.by_role.entry(performer.role()).or_default().push(performer);
        self
    }

    /// Candidates for `role` in declaration order
    pub fn candidates(&self, role: Role) -> &[Arc<dyn Performer>] {
        self.by_role.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, role: Role, name: &str) -> Option<Arc<dyn Performer>> {
        self.candidates(role).iter().find(|p| p.name() == name).cloned()
    }

    pub fn has_role(&self, role: Role) -> bool {
        !self.candidates(role).is_empty()
    }
}

impl std::fmt::Debug for PerformerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: BTreeMap<_, Vec<_>> = self
            .by_role
            .iter()
            .map(|(role, performers)| (role, performers.iter().map(|p| p.name()).collect()))
            .collect();
        f.debug_struct("PerformerRegistry").field("by_role", &names).finish()
    }
}
