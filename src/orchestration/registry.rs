//! Agent capability registry.
//!
//! The `AgentRegistry` owns one `AgentCapabilityRecord` per registered agent
//! together with the health and load last reported by the agent-pool manager.
//! Each record sits behind its own lock so that performance updates for
//! different agents never serialize on each other; the outer map lock is
//! only taken for writing on register/unregister.

use crate::agent::{AgentCapabilities, AgentHealth, AgentId, Specialization};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::util::mean;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Mean performance assumed for an agent with no observations yet.
pub const NEUTRAL_PERFORMANCE: f64 = 0.5;

/// Capability record of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilityRecord {
    pub agent_id: AgentId,
    pub specialization: Specialization,
    /// Skill level in [0, 1], nudged by observed performance.
    pub skill_level: f64,
    pub max_concurrent_tasks: usize,
    /// Most recent scores, oldest first, bounded by the history size.
    pub performance_history: VecDeque<f64>,
    /// The most recent observed score.
    pub adaptation_score: f64,
    pub learning_rate: f64,
}

impl AgentCapabilityRecord {
    fn new(agent_id: AgentId, capabilities: &AgentCapabilities, default_learning_rate: f64) -> Self {
        Self {
            agent_id,
            specialization: capabilities.specialization,
            skill_level: capabilities.skill_level,
            max_concurrent_tasks: capabilities.max_concurrent_tasks,
            performance_history: VecDeque::new(),
            adaptation_score: 0.0,
            learning_rate: capabilities
                .learning_rate
                .unwrap_or(default_learning_rate),
        }
    }

    /// Mean of the recorded scores, or the neutral prior when empty.
    pub fn mean_performance(&self) -> f64 {
        mean(self.performance_history.iter().copied()).unwrap_or(NEUTRAL_PERFORMANCE)
    }
}

/// Health and load as last reported by the agent-pool manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub health: AgentHealth,
    /// Tasks the pool reports running outside this coordinator.
    pub reported_load: usize,
    pub reported_at: Option<DateTime<Utc>>,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            health: AgentHealth::Healthy,
            reported_load: 0,
            reported_at: None,
        }
    }
}

/// Point-in-time view of an agent, as consumed by routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub specialization: Specialization,
    pub skill_level: f64,
    pub max_concurrent_tasks: usize,
    pub mean_performance: f64,
    pub health: AgentHealth,
    /// Coordinator-dispatched tasks plus the reported external load.
    pub active_tasks: usize,
    /// Tasks assigned to the agent that are still waiting for a dispatch slot.
    #[serde(default)]
    pub reserved_tasks: usize,
}

impl AgentSnapshot {
    /// Reserved tasks hold capacity but do not count as load.
    pub fn has_capacity(&self) -> bool {
        self.active_tasks + self.reserved_tasks < self.max_concurrent_tasks
    }
}

struct AgentEntry {
    record: Mutex<AgentCapabilityRecord>,
    health: Mutex<HealthReport>,
    reserved: AtomicUsize,
    dispatched: AtomicUsize,
}

impl AgentEntry {
    fn snapshot(&self) -> AgentSnapshot {
        let record = self.record.lock();
        let health = self.health.lock();
        AgentSnapshot {
            agent_id: record.agent_id.clone(),
            specialization: record.specialization,
            skill_level: record.skill_level,
            max_concurrent_tasks: record.max_concurrent_tasks,
            mean_performance: record.mean_performance(),
            health: health.health,
            active_tasks: self.dispatched.load(Ordering::SeqCst) + health.reported_load,
            reserved_tasks: self.reserved.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<AgentId, Arc<AgentEntry>>,
    /// Registration order; listings follow it.
    order: Vec<AgentId>,
}

/// Registry of agent capabilities, health and load.
pub struct AgentRegistry {
    inner: RwLock<Inner>,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
        }
    }

    /// Insert or overwrite an agent's capability record.
    ///
    /// Overwriting resets the performance history but keeps the agent's
    /// position in the listing order and its in-flight task count.
    pub fn register(&self, agent_id: AgentId, capabilities: AgentCapabilities) -> Result<()> {
        capabilities.validate()?;
        if agent_id.as_str().trim().is_empty() {
            return Err(Error::Validation("agent id must not be empty".to_string()));
        }

        let record =
            AgentCapabilityRecord::new(agent_id.clone(), &capabilities, self.config.default_learning_rate);

        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get(&agent_id) {
            *entry.record.lock() = record;
            debug!(agent = %agent_id, "agent capabilities updated");
            return Ok(());
        }

        inner.entries.insert(
            agent_id.clone(),
            Arc::new(AgentEntry {
                record: Mutex::new(record),
                health: Mutex::new(HealthReport::default()),
                reserved: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
            }),
        );
        inner.order.push(agent_id.clone());
        info!(
            agent = %agent_id,
            specialization = %capabilities.specialization,
            skill = capabilities.skill_level,
            "agent registered"
        );
        Ok(())
    }

    pub fn unregister(&self, agent_id: &AgentId) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.entries.remove(agent_id).is_none() {
            return Err(Error::AgentNotFound(agent_id.clone()));
        }
        inner.order.retain(|id| id != agent_id);
        info!(agent = %agent_id, "agent unregistered");
        Ok(())
    }

    fn entry(&self, agent_id: &AgentId) -> Result<Arc<AgentEntry>> {
        self.inner
            .read()
            .entries
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(agent_id.clone()))
    }

    /// Agents eligible for routing, in registration order.
    ///
    /// Unhealthy and offline agents are excluded, as are agents already at
    /// capacity. With a specialization only matching agents are listed.
    pub fn list_available(&self, specialization: Option<Specialization>) -> Vec<AgentSnapshot> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|entry| entry.snapshot())
            .filter(|snap| snap.health.is_routable() && snap.has_capacity())
            .filter(|snap| specialization.map_or(true, |s| snap.specialization == s))
            .collect()
    }

    /// Every registered agent regardless of health or load.
    pub fn list_all(&self) -> Vec<AgentSnapshot> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|entry| entry.snapshot())
            .collect()
    }

    pub fn snapshot(&self, agent_id: &AgentId) -> Result<AgentSnapshot> {
        Ok(self.entry(agent_id)?.snapshot())
    }

    pub fn record(&self, agent_id: &AgentId) -> Result<AgentCapabilityRecord> {
        Ok(self.entry(agent_id)?.record.lock().clone())
    }

    /// Push a performance observation and adapt the skill level.
    ///
    /// The score is clamped to [0, 1]. With learning enabled the skill level
    /// moves by `(score - 0.5) * learning_rate`, clamped to [0, 1].
    pub fn record_performance(&self, agent_id: &AgentId, score: f64) -> Result<()> {
        let entry = self.entry(agent_id)?;
        let score = score.clamp(0.0, 1.0);
        let mut record = entry.record.lock();

        record.performance_history.push_back(score);
        while record.performance_history.len() > self.config.performance_history_size {
            record.performance_history.pop_front();
        }
        if self.config.learning_enabled {
            let nudged = record.skill_level + (score - 0.5) * record.learning_rate;
            record.skill_level = nudged.clamp(0.0, 1.0);
        }
        record.adaptation_score = score;

        debug!(
            agent = %agent_id,
            score,
            skill = record.skill_level,
            "performance recorded"
        );
        Ok(())
    }

    /// Store the health and load reported by the agent-pool manager.
    pub fn report_health(&self, agent_id: &AgentId, health: AgentHealth, load: usize) -> Result<()> {
        let entry = self.entry(agent_id)?;
        let mut report = entry.health.lock();
        if report.health != health {
            info!(agent = %agent_id, from = %report.health, to = %health, "agent health changed");
        }
        *report = HealthReport {
            health,
            reported_load: load,
            reported_at: Some(Utc::now()),
        };
        Ok(())
    }

    pub fn health(&self, agent_id: &AgentId) -> Result<HealthReport> {
        Ok(self.entry(agent_id)?.health.lock().clone())
    }

    /// Hold a slot for a task routed to the agent but not yet running.
    pub fn reserve_task(&self, agent_id: &AgentId) -> Result<()> {
        self.entry(agent_id)?.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drop a reservation whose task will not be dispatched.
    pub fn release_reservation(&self, agent_id: &AgentId) {
        if let Ok(entry) = self.entry(agent_id) {
            decrement(&entry.reserved);
        }
    }

    /// Count a task dispatched to the agent, consuming its reservation if
    /// it had one.
    pub fn begin_task(&self, agent_id: &AgentId) -> Result<()> {
        let entry = self.entry(agent_id)?;
        decrement(&entry.reserved);
        entry.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Release a task slot taken by `begin_task`.
    ///
    /// Unknown agents are ignored: the agent may have been unregistered while
    /// its task was in flight.
    pub fn finish_task(&self, agent_id: &AgentId) {
        if let Ok(entry) = self.entry(agent_id) {
            decrement(&entry.dispatched);
        }
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.inner.read().entries.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}
