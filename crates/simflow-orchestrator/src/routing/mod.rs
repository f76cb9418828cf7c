//! Routing layer
//!
//! Routers are pure functions from the workflow's [`ExecutionState`] (plus
//! metrics and capacity inputs) to a [`RoutingDecision`]. A decision carries
//! the state changes it implies as [`StateUpdate`]s; only the controller that
//! owns the state applies them.

mod branch;
mod decision;
mod metrics;
mod resources;
mod router;
mod state;

pub use branch::{BranchRule, Predicate};
pub use decision::{DecisionReason, RoutingDecision, StateUpdate};
pub use metrics::{ExecutionMetrics, MetricsStore};
pub use resources::{
    CapacityProvider, ResourceRequirement, ResourceSnapshot, StaticCapacity, SystemCapacity,
};
pub use router::WorkflowRouter;
pub use state::{ExecutionState, NodeErrorRecord, NodeResult, NodeStatus};
