// Workflow plans and delegation

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use simflow_core::{TaskParams, TaskSpec};
use uuid::Uuid;

use super::classify::Role;
use super::validator::FeedbackItem;

/// One role's job for the current iteration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegatedTask {
    /// Execute node in the workflow graph
    pub node: String,
    pub role: Role,
    /// Role defaults merged with overrides; performers may swap the tool
    pub spec: TaskSpec,
    /// Plan revision that produced this task
    pub revision: u32,
}

/// Roles to run for a request, and the parameter overrides accumulated by
/// refinement
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowPlan {
    pub workflow_id: Uuid,
    pub request: String,
    roles: Vec<Role>,
    overrides: BTreeMap<Role, TaskParams>,
    tasks: Vec<DelegatedTask>,
    revision: u32,
}

impl WorkflowPlan {
    pub fn new(workflow_id: Uuid, request: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            workflow_id,
            request: request.into(),
            roles,
            overrides: BTreeMap::new(),
            tasks: Vec::new(),
            revision: 0,
        }
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Tasks from the latest `delegate` call
    pub fn tasks(&self) -> &[DelegatedTask] {
        &self.tasks
    }

    /// Number of times the plan has been delegated
    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn overrides(&self, role: Role) -> Option<&TaskParams> {
        self.overrides.get(&role)
    }

    pub fn set_override(&mut self, role: Role, key: impl Into<String>, value: impl Into<Value>) {
        self.overrides
            .entry(role)
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Effective value of a parameter: override, else role default
    pub fn param(&self, role: Role, key: &str) -> Option<Value> {
        self.overrides
            .get(&role)
            .and_then(|o| o.get(key))
            .cloned()
            .or_else(|| role.default_spec().params.get(key).cloned())
    }

    /// Build one task per role from defaults merged with overrides
    pub fn delegate(&mut self) -> &[DelegatedTask] {
        self.revision += 1;
        let revision = self.revision;
        self.tasks = self
            .roles
            .iter()
            .map(|role| {
                let mut spec = role.default_spec();
                if let Some(overrides) = self.overrides.get(role) {
                    for (key, value) in overrides {
                        spec.params.insert(key.clone(), value.clone());
                    }
                }
                DelegatedTask {
                    node: role.node(),
                    role: *role,
                    spec,
                    revision,
                }
            })
            .collect();
        &self.tasks
    }

    /// Fold validator feedback into the overrides; returns how many items
    /// changed a parameter
    pub fn apply_feedback(&mut self, feedback: &[FeedbackItem]) -> usize {
        let mut applied = 0;
        for item in feedback {
            let current = self.param(item.role, &item.parameter);
            if let Some(next) = item.adjustment.apply(current.as_ref()) {
                if current.as_ref() != Some(&next) {
                    self.set_override(item.role, item.parameter.clone(), next);
                    applied += 1;
                }
            }
        }
        applied
    }
}
