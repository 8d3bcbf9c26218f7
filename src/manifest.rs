//! TOML workflow manifests.
//!
//! A manifest bundles everything needed to run a workflow from the command
//! line: the workflow definition, the agents to register, the quality gates,
//! and settings for the simulated agent pool.
//!
//! ```toml
//! [workflow]
//! workflow_id = "release-docs"
//! task_ids = ["outline", "draft", "review"]
//!
//! [[workflow.dependencies]]
//! task_id = "draft"
//! depends_on = "outline"
//!
//! [workflow.assignments]
//! draft = "documentation"
//!
//! [[agents]]
//! agent_id = "doc1"
//! specialization = "documentation"
//! skill_level = 0.9
//!
//! [[gates]]
//! gate_id = "docs-quality"
//! required_task_ids = ["draft", "review"]
//! quality_threshold = 0.8
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{AgentCapabilities, AgentId, Specialization};
use crate::core::task::TaskId;
use crate::orchestration::{
    QualityGate, TaskDispatch, TaskExecutor, TaskOutcome, WorkflowCoordinator,
};
use crate::workflow::{WorkflowDefinition, WorkflowId};
use crate::{Error, Result};

fn default_max_concurrent() -> usize {
    1
}

fn default_blocking() -> bool {
    true
}

/// An agent declared in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub agent_id: AgentId,
    #[serde(default)]
    pub specialization: Specialization,
    pub skill_level: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub learning_rate: Option<f64>,
}

impl AgentEntry {
    pub fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            specialization: self.specialization,
            skill_level: self.skill_level,
            max_concurrent_tasks: self.max_concurrent_tasks,
            learning_rate: self.learning_rate,
        }
    }
}

/// A quality gate over tasks of the manifest's workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEntry {
    pub gate_id: String,
    pub required_task_ids: Vec<TaskId>,
    pub quality_threshold: f64,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

/// Behaviour of the simulated agent pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// How long every simulated task takes.
    pub delay_ms: u64,
    /// Quality reported for tasks without an override.
    pub default_quality: f64,
    pub task_quality: HashMap<TaskId, f64>,
    /// Tasks whose simulated agent reports an error.
    pub failing_tasks: Vec<TaskId>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            delay_ms: 10,
            default_quality: 0.9,
            task_quality: HashMap::new(),
            failing_tasks: Vec::new(),
        }
    }
}

/// A parsed workflow manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub gates: Vec<GateEntry>,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let manifest = Self::parse(&contents)?;
        debug!(
            path = %path.display(),
            workflow = %manifest.workflow.workflow_id,
            "manifest loaded"
        );
        Ok(manifest)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(contents)?;
        manifest.workflow.validate()?;
        Ok(manifest)
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow.workflow_id
    }

    pub fn quality_gates(&self) -> Vec<QualityGate> {
        self.gates
            .iter()
            .map(|entry| QualityGate {
                gate_id: entry.gate_id.clone(),
                workflow_id: self.workflow.workflow_id.clone(),
                required_task_ids: entry.required_task_ids.clone(),
                quality_threshold: entry.quality_threshold,
                blocking: entry.blocking,
                status: Default::default(),
            })
            .collect()
    }

    /// Register agents, the workflow and its gates with a running coordinator.
    pub fn install(&self, coordinator: &WorkflowCoordinator) -> Result<WorkflowId> {
        for agent in &self.agents {
            coordinator.register_agent(agent.agent_id.clone(), agent.capabilities())?;
        }
        coordinator.register_workflow(self.workflow.clone())?;
        for gate in self.quality_gates() {
            coordinator.register_quality_gate(gate)?;
        }
        Ok(self.workflow.workflow_id.clone())
    }

    pub fn simulated_executor(&self) -> SimulatedExecutor {
        SimulatedExecutor::new(self.simulation.clone())
    }
}

/// Agent pool stand-in that sleeps and reports configured qualities.
pub struct SimulatedExecutor {
    settings: SimulationSettings,
}

impl SimulatedExecutor {
    pub fn new(settings: SimulationSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, dispatch: TaskDispatch) -> Result<TaskOutcome> {
        tokio::time::sleep(Duration::from_millis(self.settings.delay_ms)).await;

        if self.settings.failing_tasks.contains(&dispatch.task_id) {
            return Err(Error::TaskExecution(format!(
                "simulated failure of {} on {}",
                dispatch.task_id, dispatch.agent_id
            )));
        }

        let quality = self
            .settings
            .task_quality
            .get(&dispatch.task_id)
            .copied()
            .unwrap_or(self.settings.default_quality);

        Ok(TaskOutcome::new(quality).with_output(serde_json::json!({
            "agent": dispatch.agent_id,
            "attempt": dispatch.attempt,
            "context_keys": dispatch.context.keys().collect::<Vec<_>>(),
        })))
    }
}
