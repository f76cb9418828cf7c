//! # SimFlow Orchestrator
//!
//! Workflow orchestration for long-running, failure-prone simulation jobs.
//!
//! ## Features
//!
//! - **Task pipeline**: Non-blocking submission, event-driven waiting, cancellation and batch workflows
//! - **Automatic retries**: Exponential backoff capped at a maximum delay
//! - **Circuit breakers**: Per-node breakers that stop hammering a failing node
//! - **Adaptive routing**: Conditional, resource-aware and performance-based decisions
//! - **Conductor**: Analyze, delegate, execute in parallel, validate, refine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Conductor                            │
//! │  (owns ExecutionState, applies router decisions)             │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │      WorkflowRouter      │   │  Performers (per role)       │
//! │  (pure decision funcs)   │   │  (structural, MD, CFD)       │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                                              │
//!                                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskPipeline                          │
//! │  (submit / status / wait / cancel over a TaskExecutor)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use simflow_orchestrator::prelude::*;
//!
//! let executor = LocalProcessExecutor::new()
//!     .with_tool("openfoam", "/opt/openfoam/bin/run-case");
//! let pipeline = Arc::new(TaskPipeline::new(Arc::new(executor), PipelineConfig::default()));
//! let conductor = Conductor::with_pipeline(pipeline);
//!
//! let outcome = conductor
//!     .run(WorkflowRequest::new("cfd airflow over an airfoil").with_max_iterations(2))
//!     .await?;
//! println!("{:?} after {} iterations", outcome.status, outcome.iterations);
//! ```

pub mod conductor;
pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod reliability;
pub mod routing;

/// Prelude for common imports
pub mod prelude {
    pub use crate::conductor::{
        Conductor, ConductorConfig, Performer, PerformerRegistry, Role, Validator,
        WorkflowOutcome, WorkflowRequest, WorkflowStatus,
    };
    pub use crate::config::SimflowConfig;
    pub use crate::error::{ConductorError, ConfigError, ExecutorError, PipelineError};
    pub use crate::executor::{LocalProcessExecutor, StubExecutor, StubOutcome, TaskExecutor};
    pub use crate::pipeline::{
        FailurePolicy, PipelineConfig, RunStatus, SubmissionMode, TaskPipeline, WorkflowRun,
    };
    pub use crate::reliability::{BackoffPolicy, CircuitBreakerConfig};
    pub use crate::routing::{
        ExecutionMetrics, ExecutionState, MetricsStore, RoutingDecision, WorkflowRouter,
    };
    pub use simflow_core::{
        ErrorKind, EventSink, NodeError, Severity, Task, TaskId, TaskSpec, TaskStatus,
    };
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use conductor::{Conductor, ConductorConfig, WorkflowOutcome, WorkflowRequest, WorkflowStatus};
pub use config::SimflowConfig;
pub use error::{ConductorError, ConfigError, ExecutorError, PipelineError};
pub use executor::{LocalProcessExecutor, StubExecutor, StubOutcome, TaskExecutor};
pub use pipeline::{FailurePolicy, PipelineConfig, SubmissionMode, TaskPipeline};
pub use reliability::{BackoffPolicy, CircuitBreakerConfig};
pub use routing::{ExecutionMetrics, MetricsStore, RoutingDecision, WorkflowRouter};
