//! Workflow runtime state with status transition validation.
//!
//! `WorkflowRuntimeState` is created when a workflow starts executing and is
//! refreshed from its task states after every group barrier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::{TaskId, TaskRuntimeState, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::CoordinationMetrics;

use super::{WorkflowId, WorkflowStatus};

/// A record of a status transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: WorkflowStatus,
    pub entered_at: DateTime<Utc>,
}

/// Snapshot-able runtime state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRuntimeState {
    pub workflow_id: WorkflowId,
    /// Distinguishes repeated executions of the same definition.
    pub execution_id: Uuid,
    pub status: WorkflowStatus,
    /// Mean task progress in [0, 100].
    pub progress_percent: f64,
    pub active_task_ids: Vec<TaskId>,
    pub completed_task_ids: Vec<TaskId>,
    pub failed_task_ids: Vec<TaskId>,
    pub blocked_task_ids: Vec<TaskId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub estimated_completion_time: Option<DateTime<Utc>>,
    pub metrics: Option<CoordinationMetrics>,
    status_history: Vec<StatusHistoryEntry>,
}

impl WorkflowRuntimeState {
    /// State for a workflow entering execution.
    pub fn new(workflow_id: WorkflowId) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            execution_id: Uuid::new_v4(),
            status: WorkflowStatus::Initializing,
            progress_percent: 0.0,
            active_task_ids: Vec::new(),
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            blocked_task_ids: Vec::new(),
            started_at: now,
            finished_at: None,
            estimated_completion_time: None,
            metrics: None,
            status_history: vec![StatusHistoryEntry {
                status: WorkflowStatus::Initializing,
                entered_at: now,
            }],
        }
    }

    /// Placeholder for a workflow that is registered but has not run.
    pub fn registered(workflow_id: WorkflowId) -> Self {
        let mut state = Self::new(workflow_id);
        state.status = WorkflowStatus::Registered;
        state.status_history[0].status = WorkflowStatus::Registered;
        state
    }

    /// Check if a transition to the target status is valid from the current one.
    ///
    /// - Registered -> Initializing
    /// - Initializing -> Executing | Failed | Cancelled | Completed
    /// - Executing -> Completed | Failed | Cancelled
    ///
    /// `Initializing -> Completed` is the degenerate run where every task
    /// was already settled without a dispatch.
    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self.status, target),
            (Registered, Initializing)
                | (Initializing, Executing)
                | (Initializing, Completed)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
        )
    }

    pub fn transition(&mut self, target: WorkflowStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        self.status = target;
        let now = Utc::now();
        self.status_history.push(StatusHistoryEntry {
            status: target,
            entered_at: now,
        });
        if target.is_terminal() {
            self.finished_at = Some(now);
            self.estimated_completion_time = Some(now);
        }
        Ok(())
    }

    pub fn status_history(&self) -> &[StatusHistoryEntry] {
        &self.status_history
    }

    /// Recompute progress, id lists and the completion estimate.
    ///
    /// `tasks` must be in definition order; the id lists keep that order.
    pub fn refresh<'a, I>(&mut self, tasks: I, estimated_duration: chrono::Duration)
    where
        I: IntoIterator<Item = &'a TaskRuntimeState>,
    {
        self.active_task_ids.clear();
        self.completed_task_ids.clear();
        self.failed_task_ids.clear();
        self.blocked_task_ids.clear();

        let mut total = 0usize;
        let mut progress = 0.0;
        for task in tasks {
            total += 1;
            progress += task.progress_percent;
            let bucket = match task.status {
                TaskStatus::Assigned | TaskStatus::InProgress => &mut self.active_task_ids,
                TaskStatus::Completed => &mut self.completed_task_ids,
                TaskStatus::Failed { .. } => &mut self.failed_task_ids,
                TaskStatus::Blocked { .. } => &mut self.blocked_task_ids,
                _ => continue,
            };
            bucket.push(task.task_id.clone());
        }

        self.progress_percent = if total == 0 {
            0.0
        } else {
            progress / total as f64
        };

        if self.status.is_terminal() {
            return;
        }
        let done = self.completed_task_ids.len() + self.failed_task_ids.len();
        self.estimated_completion_time = if done == 0 || total == 0 {
            self.started_at.checked_add_signed(estimated_duration)
        } else {
            // Extrapolate from the observed pace.
            let elapsed = Utc::now() - self.started_at;
            let per_task = elapsed / done as i32;
            Some(Utc::now() + per_task * (total - done) as i32)
        };
    }

    pub fn total_tracked(&self) -> usize {
        self.active_task_ids.len()
            + self.completed_task_ids.len()
            + self.failed_task_ids.len()
            + self.blocked_task_ids.len()
    }
}
