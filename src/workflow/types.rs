//! Core workflow type definitions.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::agent::Specialization;
use crate::core::task::{DependencyKind, TaskDependency, TaskId};
use crate::error::{Error, Result};

/// Unique identifier of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a workflow in its lifecycle.
///
/// `Registered -> Initializing -> Executing -> {Completed | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Definition stored, never executed.
    #[default]
    Registered,
    /// Runtime state created, nothing dispatched yet.
    Initializing,
    /// At least one task has been dispatched.
    Executing,
    Completed,
    Failed,
    /// Cancelled at a group barrier.
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, WorkflowStatus::Initializing | WorkflowStatus::Executing)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Registered => write!(f, "registered"),
            WorkflowStatus::Initializing => write!(f, "initializing"),
            WorkflowStatus::Executing => write!(f, "executing"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn default_parallel() -> bool {
    true
}

/// Declarative workflow: tasks, dependencies and specialization assignments.
///
/// Immutable once registered with the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: WorkflowId,
    /// Tasks in definition order. Dispatch order within a group follows it.
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    /// Required specialization per task; unassigned tasks need `General`.
    #[serde(default)]
    pub assignments: HashMap<TaskId, Specialization>,
    #[serde(default)]
    pub priorities: HashMap<TaskId, u32>,
    #[serde(default = "default_parallel")]
    pub parallel_execution: bool,
    /// Concurrency bound per group; 0 selects the coordinator default.
    #[serde(default)]
    pub max_parallel_tasks: usize,
    #[serde(default)]
    pub estimated_duration_minutes: u64,
}

/// Longest accepted duration estimate: one hundred years.
pub const MAX_ESTIMATED_DURATION_MINUTES: u64 = 100 * 365 * 24 * 60;

impl WorkflowDefinition {
    pub fn new<I, T>(workflow_id: impl Into<WorkflowId>, task_ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self {
            workflow_id: workflow_id.into(),
            task_ids: task_ids.into_iter().map(Into::into).collect(),
            dependencies: Vec::new(),
            assignments: HashMap::new(),
            priorities: HashMap::new(),
            parallel_execution: true,
            max_parallel_tasks: 0,
            estimated_duration_minutes: 0,
        }
    }

    /// `task` waits for `depends_on` to complete.
    pub fn blocking(mut self, task: &str, depends_on: &str) -> Self {
        self.dependencies.push(TaskDependency::blocking(task, depends_on));
        self
    }

    /// `task` prefers to run after `depends_on`, but does not wait for it.
    pub fn soft(mut self, task: &str, depends_on: &str) -> Self {
        self.dependencies.push(TaskDependency::soft(task, depends_on));
        self
    }

    pub fn assign(mut self, task: &str, specialization: Specialization) -> Self {
        self.assignments.insert(TaskId::from(task), specialization);
        self
    }

    pub fn with_priority(mut self, task: &str, priority: u32) -> Self {
        self.priorities.insert(TaskId::from(task), priority);
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    pub fn with_estimated_duration(mut self, minutes: u64) -> Self {
        self.estimated_duration_minutes = minutes;
        self
    }

    /// Run every task one at a time.
    pub fn sequential(mut self) -> Self {
        self.parallel_execution = false;
        self
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_ids.contains(id)
    }

    pub fn specialization_for(&self, id: &TaskId) -> Specialization {
        self.assignments.get(id).copied().unwrap_or_default()
    }

    pub fn priority_for(&self, id: &TaskId) -> u32 {
        self.priorities.get(id).copied().unwrap_or(0)
    }

    /// All dependencies declared for `id`, in definition order.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskDependency> {
        self.dependencies
            .iter()
            .filter(|dep| &dep.task_id == id)
            .cloned()
            .collect()
    }

    pub fn has_blocking_dependency(&self, id: &TaskId) -> bool {
        self.dependencies
            .iter()
            .any(|dep| &dep.task_id == id && dep.kind == DependencyKind::Blocking)
    }

    /// Structural validation. Cycle detection happens on the dependency graph.
    pub fn validate(&self) -> Result<()> {
        if self.workflow_id.as_str().trim().is_empty() {
            return Err(Error::Validation("workflow id must not be empty".to_string()));
        }
        if self.task_ids.is_empty() {
            return Err(Error::Validation(format!(
                "workflow {} has no tasks",
                self.workflow_id
            )));
        }

        let mut seen = HashSet::new();
        for id in &self.task_ids {
            if !seen.insert(id) {
                return Err(Error::Validation(format!(
                    "workflow {} lists task {} more than once",
                    self.workflow_id, id
                )));
            }
        }

        for dep in &self.dependencies {
            for id in [&dep.task_id, &dep.depends_on] {
                if !seen.contains(id) {
                    return Err(Error::Validation(format!(
                        "dependency {} -> {} references unknown task {}",
                        dep.task_id, dep.depends_on, id
                    )));
                }
            }
        }

        if self.estimated_duration_minutes > MAX_ESTIMATED_DURATION_MINUTES {
            return Err(Error::Validation(format!(
                "workflow {} estimates {} minutes, more than the maximum of {}",
                self.workflow_id, self.estimated_duration_minutes, MAX_ESTIMATED_DURATION_MINUTES
            )));
        }

        for id in self.assignments.keys().chain(self.priorities.keys()) {
            if !seen.contains(id) {
                return Err(Error::Validation(format!(
                    "assignment references unknown task {}",
                    id
                )));
            }
        }

        Ok(())
    }
}
