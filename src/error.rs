use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::TaskId;
use crate::workflow::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("No agent available for task {0}")]
    NoAgentAvailable(TaskId),

    #[error("Task {task_id} timed out after {after:?}")]
    TaskTimeout { task_id: TaskId, after: Duration },

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Coordinator is not running")]
    CoordinatorNotRunning,

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Workflow already registered: {0}")]
    WorkflowExists(WorkflowId),

    #[error("Workflow is already running: {0}")]
    WorkflowAlreadyRunning(WorkflowId),

    #[error("Quality gate not found: {0}")]
    GateNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether this error rejects a malformed definition.
    ///
    /// Cyclic dependencies are a kind of validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::CyclicDependency { .. })
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
