// Result validation and refinement feedback
//
// The validator does not judge physics. It checks that every branch finished
// successfully and that payloads are structurally sane, and translates each
// problem into a parameter adjustment for the next iteration.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use simflow_core::{ErrorKind, NodeError, TaskStatus};

use super::classify::Role;
use crate::routing::NodeResult;

/// Change to one task parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Adjustment {
    /// Multiply a numeric parameter; integers stay integers (at least 1)
    Scale(f64),
    /// Replace the parameter
    Set(Value),
}

impl Adjustment {
    /// New value for `current`; `None` when the adjustment cannot apply
    pub fn apply(&self, current: Option<&Value>) -> Option<Value> {
        match self {
            Adjustment::Set(value) => Some(value.clone()),
            Adjustment::Scale(factor) => {
                let current = current?;
                if current.is_i64() || current.is_u64() {
                    let scaled = (current.as_f64()? * factor).round().max(1.0);
                    Some(json!(scaled as i64))
                } else {
                    current.as_f64().map(|v| json!(v * factor))
                }
            }
        }
    }
}

/// Structured refinement hint for one role
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackItem {
    pub role: Role,
    pub parameter: String,
    pub adjustment: Adjustment,
    pub reason: String,
}

impl FeedbackItem {
    pub fn new(
        role: Role,
        parameter: impl Into<String>,
        adjustment: Adjustment,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            role,
            parameter: parameter.into(),
            adjustment,
            reason: reason.into(),
        }
    }
}

/// Terminal state of one execute branch, as seen by validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchResult {
    pub node: String,
    pub role: Role,
    pub status: TaskStatus,
    pub result: Option<NodeResult>,
}

/// A validation problem attributed to a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationFailure {
    pub node: String,
    pub error: NodeError,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub checked: usize,
    pub feedback: Vec<FeedbackItem>,
    pub errors: Vec<ValidationFailure>,
}

/// Payload checks for one role
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoleChecks {
    /// Keys that must be present with finite numeric values
    pub required_numeric: Vec<String>,
    /// Boolean key that must be `true`
    pub convergence_flag: Option<String>,
}

impl RoleChecks {
    pub fn new<I, S>(required_numeric: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_numeric: required_numeric.into_iter().map(Into::into).collect(),
            convergence_flag: None,
        }
    }

    pub fn with_convergence_flag(mut self, key: impl Into<String>) -> Self {
        self.convergence_flag = Some(key.into());
        self
    }
}

enum Issue {
    Failed(ErrorKind),
    MalformedOutput,
    NonFinite,
    NotConverged,
}

#[derive(Debug, Clone)]
pub struct Validator {
    checks: BTreeMap<Role, RoleChecks>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
            .with_checks(
                Role::Structural,
                RoleChecks::new(["max_stress", "max_displacement"]),
            )
            .with_checks(
                Role::MolecularDynamics,
                RoleChecks::new(["total_energy", "temperature_k"]),
            )
            .with_checks(
                Role::Cfd,
                RoleChecks::new(["residual"]).with_convergence_flag("converged"),
            )
    }
}

impl Validator {
    /// Validator without role-specific payload checks
    pub fn new() -> Self {
        Self {
            checks: BTreeMap::new(),
        }
    }

    pub fn with_checks(mut self, role: Role, checks: RoleChecks) -> Self {
        self.checks.insert(role, checks);
        self
    }

    pub fn validate(&self, results: &[BranchResult]) -> ValidationReport {
        let mut report = ValidationReport {
            passed: true,
            checked: results.len(),
            ..Default::default()
        };

        for branch in results {
            for (issue, error) in self.inspect(branch) {
                report.passed = false;
                report.feedback.extend(feedback_for(branch.role, &issue));
                report.errors.push(ValidationFailure {
                    node: branch.node.clone(),
                    error,
                });
            }
        }
        report
    }

    fn inspect(&self, branch: &BranchResult) -> Vec<(Issue, NodeError)> {
        if branch.status != TaskStatus::Success {
            let error = branch
                .result
                .as_ref()
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| {
                    NodeError::execution(format!("{} finished with status {}", branch.node, branch.status))
                });
            return vec![(Issue::Failed(error.kind), error)];
        }

        let output = match branch.result.as_ref().and_then(|r| r.output.as_ref()) {
            Some(Value::Object(map)) if !map.is_empty() => map,
            _ => {
                return vec![(
                    Issue::MalformedOutput,
                    NodeError::validation(format!("{} returned an empty or non-object result", branch.node)),
                )]
            }
        };

        let Some(checks) = self.checks.get(&branch.role) else {
            return Vec::new();
        };

        let mut issues = Vec::new();
        for key in &checks.required_numeric {
            match output.get(key).and_then(Value::as_f64) {
                Some(v) if v.is_finite() => {}
                Some(_) | None => issues.push((
                    Issue::NonFinite,
                    NodeError::validation(format!(
                        "{}: '{}' is missing or not a finite number",
                        branch.node, key
                    )),
                )),
            }
        }
        if let Some(flag) = &checks.convergence_flag {
            if output.get(flag).and_then(Value::as_bool) != Some(true) {
                issues.push((
                    Issue::NotConverged,
                    NodeError::validation(format!("{}: '{}' is not true", branch.node, flag)),
                ));
            }
        }
        issues
    }
}

fn feedback_for(role: Role, issue: &Issue) -> Vec<FeedbackItem> {
    use Adjustment::{Scale, Set};

    let item = |param: &str, adjustment: Adjustment, reason: &str| {
        vec![FeedbackItem::new(role, param, adjustment, reason)]
    };

    match (role, issue) {
        (Role::Structural | Role::Cfd, Issue::Failed(ErrorKind::Timeout)) => {
            item("mesh_resolution", Scale(0.5), "job timed out; coarsen mesh")
        }
        (Role::MolecularDynamics, Issue::Failed(ErrorKind::Timeout)) => {
            item("steps", Scale(0.5), "job timed out; shorten run")
        }
        (Role::Structural | Role::Cfd, Issue::Failed(ErrorKind::Execution)) => {
            item("solver_tolerance", Scale(10.0), "solver failed; relax tolerance")
        }
        (Role::MolecularDynamics, Issue::Failed(ErrorKind::Execution)) => {
            item("timestep_fs", Scale(0.5), "integration failed; reduce timestep")
        }
        (Role::MolecularDynamics, Issue::Failed(ErrorKind::Resource)) => {
            item("gpus", Set(json!(0)), "insufficient resources; run on CPU")
        }
        (_, Issue::Failed(ErrorKind::Resource)) => {
            item("cores", Scale(0.5), "insufficient resources; request fewer cores")
        }
        (_, Issue::Failed(_)) | (_, Issue::MalformedOutput) => Vec::new(),
        (Role::MolecularDynamics, Issue::NonFinite) => {
            item("timestep_fs", Scale(0.5), "non-finite observables; reduce timestep")
        }
        (_, Issue::NonFinite) => {
            item("solver_tolerance", Scale(0.1), "non-finite observables; tighten tolerance")
        }
        (_, Issue::NotConverged) => item(
            "max_solver_iterations",
            Scale(2.0),
            "solver did not converge; allow more iterations",
        ),
    }
}
