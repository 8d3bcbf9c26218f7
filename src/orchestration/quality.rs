//! Quality gates.
//!
//! A gate passes when every required task is completed and the mean quality
//! score of those tasks reaches the gate threshold.

use crate::core::task::{TaskId, TaskRuntimeState, TaskStatus};
use crate::error::{Error, Result};
use crate::util::mean;
use crate::workflow::WorkflowId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Pending => write!(f, "pending"),
            GateStatus::Passed => write!(f, "passed"),
            GateStatus::Failed => write!(f, "failed"),
        }
    }
}

fn default_blocking() -> bool {
    true
}

/// A checkpoint over a set of tasks of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub gate_id: String,
    pub workflow_id: WorkflowId,
    pub required_task_ids: Vec<TaskId>,
    /// Minimum mean quality in [0, 1].
    pub quality_threshold: f64,
    /// A failing blocking gate fails the workflow.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    #[serde(default)]
    pub status: GateStatus,
}

impl QualityGate {
    pub fn new<I, T>(
        gate_id: impl Into<String>,
        workflow_id: impl Into<WorkflowId>,
        required_task_ids: I,
        quality_threshold: f64,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self {
            gate_id: gate_id.into(),
            workflow_id: workflow_id.into(),
            required_task_ids: required_task_ids.into_iter().map(Into::into).collect(),
            quality_threshold,
            blocking: true,
            status: GateStatus::Pending,
        }
    }

    /// An advisory gate whose outcome does not decide the workflow status.
    pub fn advisory(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.gate_id.trim().is_empty() {
            return Err(Error::Validation("gate id must not be empty".to_string()));
        }
        if self.required_task_ids.is_empty() {
            return Err(Error::Validation(format!(
                "gate {} requires no tasks",
                self.gate_id
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(Error::Validation(format!(
                "gate {} threshold must be within [0, 1], got {}",
                self.gate_id, self.quality_threshold
            )));
        }
        Ok(())
    }

    /// Evaluate the gate against task states and record the outcome.
    ///
    /// # Errors
    /// `Error::Validation` if a required task is not among `tasks`. The gate
    /// status is left untouched in that case.
    pub fn evaluate(&mut self, tasks: &HashMap<TaskId, TaskRuntimeState>) -> Result<bool> {
        let mut required = Vec::with_capacity(self.required_task_ids.len());
        for id in &self.required_task_ids {
            let task = tasks.get(id).ok_or_else(|| {
                Error::Validation(format!("gate {} references unknown task {}", self.gate_id, id))
            })?;
            required.push(task);
        }

        let passed = if required.iter().all(|t| t.status == TaskStatus::Completed) {
            let quality = mean(required.iter().map(|t| t.quality_score)).unwrap_or(0.0);
            quality >= self.quality_threshold
        } else {
            false
        };

        self.status = if passed {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        };
        Ok(passed)
    }
}

/// Owns registered gates and the pass/fail counters.
#[derive(Default)]
pub struct QualityGateEvaluator {
    gates: RwLock<Vec<QualityGate>>,
    passed: AtomicU64,
    failed: AtomicU64,
}

impl QualityGateEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a gate, replacing any gate with the same id.
    pub fn register(&self, mut gate: QualityGate) -> Result<()> {
        gate.validate()?;
        gate.status = GateStatus::Pending;

        let mut gates = self.gates.write();
        match gates.iter_mut().find(|g| g.gate_id == gate.gate_id) {
            Some(existing) => *existing = gate,
            None => gates.push(gate),
        }
        Ok(())
    }

    pub fn get(&self, gate_id: &str) -> Result<QualityGate> {
        self.gates
            .read()
            .iter()
            .find(|g| g.gate_id == gate_id)
            .cloned()
            .ok_or_else(|| Error::GateNotFound(gate_id.to_string()))
    }

    /// Gates of a workflow in registration order.
    pub fn gates_for(&self, workflow_id: &WorkflowId) -> Vec<QualityGate> {
        self.gates
            .read()
            .iter()
            .filter(|g| &g.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    /// Evaluate one gate, update its status and bump the counters.
    pub fn evaluate(
        &self,
        gate_id: &str,
        tasks: &HashMap<TaskId, TaskRuntimeState>,
    ) -> Result<bool> {
        let mut gates = self.gates.write();
        let gate = gates
            .iter_mut()
            .find(|g| g.gate_id == gate_id)
            .ok_or_else(|| Error::GateNotFound(gate_id.to_string()))?;

        let passed = gate.evaluate(tasks)?;
        if passed {
            self.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            gate = %gate.gate_id,
            workflow = %gate.workflow_id,
            threshold = gate.quality_threshold,
            passed,
            "quality gate evaluated"
        );
        Ok(passed)
    }

    /// Drop every gate of a workflow.
    pub fn remove_workflow(&self, workflow_id: &WorkflowId) -> usize {
        let mut gates = self.gates.write();
        let before = gates.len();
        gates.retain(|g| &g.workflow_id != workflow_id);
        before - gates.len()
    }

    pub fn passed_count(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.gates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
