//! Conductor / performer / validator
//!
//! This module provides:
//! - [`Classifier`] - Ordered rule table mapping requests to [`Role`]s
//! - [`WorkflowPlan`] - Roles, delegated tasks and refinement overrides
//! - [`Performer`] - Domain executors, with [`PerformerRegistry`] per role
//! - [`Validator`] - Result checks and refinement feedback
//! - [`Conductor`] - The state machine driving a workflow to a terminal outcome

mod classify;
mod controller;
mod performer;
mod plan;
mod validator;

pub use classify::{ClassificationRule, Classifier, Matcher, Role};
pub use controller::{
    nodes, Conductor, ConductorConfig, WorkflowHandle, WorkflowOutcome, WorkflowRequest,
    WorkflowStatus, ITERATIONS_REMAINING, VALIDATION_PASSED,
};
pub use performer::{
    CfdPerformer, MolecularDynamicsPerformer, Performer, PerformerContext, PerformerOutcome,
    PerformerRegistry, PipelinePerformer, StructuralPerformer,
};
pub use plan::{DelegatedTask, WorkflowPlan};
pub use validator::{
    Adjustment, BranchResult, FeedbackItem, RoleChecks, ValidationFailure, ValidationReport,
    Validator,
};
