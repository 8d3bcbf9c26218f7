//! Task runtime model for workflow execution.
//!
//! A `TaskRuntimeState` exists per (workflow, task) pair for the duration of
//! a workflow run. It tracks status, assignment, progress, quality and timing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, Specialization};
use crate::error::{Error, Result};
use crate::workflow::WorkflowId;

/// Identifier of a task within a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strength of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The predecessor must complete before the dependent is ready.
    #[default]
    Blocking,
    /// Advisory ordering hint; dropped from the effective wait-list.
    Soft,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Blocking => write!(f, "blocking"),
            DependencyKind::Soft => write!(f, "soft"),
        }
    }
}

/// `task_id` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: TaskId,
    pub depends_on: TaskId,
    #[serde(default)]
    pub kind: DependencyKind,
}

impl TaskDependency {
    pub fn blocking(task_id: impl Into<TaskId>, depends_on: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::Blocking,
        }
    }

    pub fn soft(task_id: impl Into<TaskId>, depends_on: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::Soft,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.kind == DependencyKind::Blocking
    }
}

/// Why a task is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum BlockReason {
    /// Routing found no agent. Retried on the next scheduling pass.
    NoAgentAvailable,
    /// A blocking predecessor failed or is itself permanently blocked.
    DependencyFailed { dependency: TaskId },
}

impl BlockReason {
    /// Whether a later scheduling pass may unblock the task.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BlockReason::NoAgentAvailable)
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::NoAgentAvailable => write!(f, "no agent available"),
            BlockReason::DependencyFailed { dependency } => {
                write!(f, "dependency {} did not complete", dependency)
            }
        }
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// pending ──► waiting_dependency ──► ready ──► assigned ──► in_progress ──► completed
///    │               │                 │          │               ├──────► failed
///    └───────────────┴─────────────────┴──────────┴──────────────►└──────► blocked
/// ```
///
/// Blocked tasks with a retriable reason may return to `ready` or
/// `waiting_dependency` on a later pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Created with no blocking dependency.
    #[default]
    Pending,
    /// At least one blocking dependency has not completed.
    WaitingDependency,
    /// Dependencies satisfied, awaiting routing.
    Ready,
    /// Routed to an agent, not yet dispatched.
    Assigned,
    /// Dispatched and running.
    InProgress,
    Completed,
    Failed {
        error: String,
    },
    Blocked {
        reason: BlockReason,
    },
}

impl TaskStatus {
    /// Terminal for the purpose of a group barrier.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }

    /// Terminal and never revisited by the scheduler.
    pub fn is_final(&self) -> bool {
        match self {
            TaskStatus::Completed | TaskStatus::Failed { .. } => true,
            TaskStatus::Blocked { reason } => !reason.is_retriable(),
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::WaitingDependency => "waiting_dependency",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Runtime state of one task within one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRuntimeState {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    pub assigned_agent_id: Option<AgentId>,
    pub required_specialization: Specialization,
    pub priority: u32,
    pub dependencies: Vec<TaskDependency>,
    pub status: TaskStatus,
    /// Progress in [0, 100].
    pub progress_percent: f64,
    /// Quality in [0, 1]; 0 means unset.
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
    /// When the task was dispatched to its agent.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached completed or failed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of dispatch attempts.
    pub attempts: u32,
}

impl TaskRuntimeState {
    /// Create the runtime state for a task about to be scheduled.
    ///
    /// Starts in `WaitingDependency` when any dependency is blocking,
    /// otherwise in `Pending`.
    pub fn new(
        workflow_id: WorkflowId,
        task_id: TaskId,
        required_specialization: Specialization,
        priority: u32,
        dependencies: Vec<TaskDependency>,
    ) -> Self {
        let status = if dependencies.iter().any(TaskDependency::is_blocking) {
            TaskStatus::WaitingDependency
        } else {
            TaskStatus::Pending
        };
        Self {
            task_id,
            workflow_id,
            assigned_agent_id: None,
            required_specialization,
            priority,
            dependencies,
            status,
            progress_percent: 0.0,
            quality_score: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
        }
    }

    /// Dependencies that gate readiness. Soft dependencies are elided.
    pub fn blocking_dependencies(&self) -> impl Iterator<Item = &TaskId> {
        self.dependencies
            .iter()
            .filter(|dep| dep.is_blocking())
            .map(|dep| &dep.depends_on)
    }

    pub fn can_transition(&self, target: &TaskStatus) -> bool {
        use TaskStatus::*;
        match (&self.status, target) {
            (Pending, WaitingDependency | Ready | Blocked { .. }) => true,
            (WaitingDependency, WaitingDependency | Ready | Blocked { .. }) => true,
            (Ready, Assigned | Blocked { .. }) => true,
            (Assigned, InProgress | Failed { .. } | Blocked { .. }) => true,
            (InProgress, Completed | Failed { .. } | Blocked { .. }) => true,
            (Blocked { reason }, Ready | WaitingDependency | Blocked { .. }) => {
                reason.is_retriable()
            }
            _ => false,
        }
    }

    fn transition(&mut self, target: TaskStatus) -> Result<()> {
        if !self.can_transition(&target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    pub fn mark_waiting(&mut self) -> Result<()> {
        self.transition(TaskStatus::WaitingDependency)
    }

    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(TaskStatus::Ready)
    }

    pub fn assign(&mut self, agent_id: AgentId) -> Result<()> {
        self.transition(TaskStatus::Assigned)?;
        self.assigned_agent_id = Some(agent_id);
        Ok(())
    }

    /// Record the dispatch to the assigned agent.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.attempts += 1;
        Ok(())
    }

    /// Mark the task completed with the quality its agent reported.
    pub fn complete(&mut self, quality_score: f64, at: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.quality_score = quality_score.clamp(0.0, 1.0);
        self.progress_percent = 100.0;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, error: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Failed {
            error: error.to_string(),
        })?;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn block(&mut self, reason: BlockReason) -> Result<()> {
        self.transition(TaskStatus::Blocked { reason })?;
        self.assigned_agent_id = None;
        Ok(())
    }

    pub fn set_progress(&mut self, percent: f64) {
        self.progress_percent = percent.clamp(0.0, 100.0);
    }

    /// Wall time between dispatch and completion.
    pub fn execution_time(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}
