//! Score-based task routing.
//!
//! The router ranks candidate agents with a weighted linear heuristic:
//!
//! ```text
//! score = w_spec * match + w_skill * skill_level + w_perf * mean_performance
//! score *= 1 - min(active_tasks / load_saturation, 1)
//! ```
//!
//! Winning decisions are cached per (task, specialization). The cache is
//! cleared wholesale once it reaches its size bound or its eviction
//! interval elapses; there is no per-entry expiry.

use crate::agent::{AgentId, Specialization};
use crate::config::RoutingConfig;
use crate::core::task::TaskId;
use crate::orchestration::registry::AgentSnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Weights of the three score components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingWeights {
    pub specialization: f64,
    pub skill: f64,
    pub performance: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self::from(&RoutingConfig::default())
    }
}

impl From<&RoutingConfig> for RoutingWeights {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            specialization: config.specialization_weight,
            skill: config.skill_weight,
            performance: config.performance_weight,
        }
    }
}

/// What the router needs to know about a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingRequest {
    pub task_id: TaskId,
    pub specialization: Specialization,
}

impl RoutingRequest {
    pub fn new(task_id: TaskId, specialization: Specialization) -> Self {
        Self {
            task_id,
            specialization,
        }
    }
}

/// Router cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cached_entries: usize,
}

#[derive(Debug, Clone)]
struct CachedRoute {
    agent_id: AgentId,
    score: f64,
}

struct RouteCache {
    entries: HashMap<(TaskId, Specialization), CachedRoute>,
    last_eviction: Instant,
}

/// Selects the best agent for a task.
pub struct TaskRouter {
    config: RoutingConfig,
    weights: RoutingWeights,
    cache: Mutex<RouteCache>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TaskRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            weights: RoutingWeights::from(&config),
            config,
            cache: Mutex::new(RouteCache {
                entries: HashMap::new(),
                last_eviction: Instant::now(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn weights(&self) -> RoutingWeights {
        self.weights
    }

    /// Composite score of `agent` for a task requiring `required`.
    pub fn score(&self, required: Specialization, agent: &AgentSnapshot) -> f64 {
        let matched = if agent.specialization == required {
            1.0
        } else {
            0.0
        };
        let base = self.weights.specialization * matched
            + self.weights.skill * agent.skill_level
            + self.weights.performance * agent.mean_performance;

        let saturation = self.config.load_saturation.max(1) as f64;
        let load_factor = 1.0 - (agent.active_tasks as f64 / saturation).min(1.0);
        base * load_factor
    }

    /// Pick an agent among `candidates`, or `None` when there are none.
    ///
    /// A cached decision is reused when its score exceeds the confidence
    /// threshold and its agent is still a candidate. Otherwise every
    /// candidate is scored and the first highest-scoring one wins. When no
    /// candidate scores above zero the first candidate is returned.
    pub fn select_agent(
        &self,
        request: &RoutingRequest,
        candidates: &[AgentSnapshot],
    ) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }

        let key = (request.task_id.clone(), request.specialization);
        {
            let mut cache = self.cache.lock();
            self.evict_if_due(&mut cache);
            if let Some(cached) = cache.entries.get(&key) {
                let still_candidate = candidates.iter().any(|c| c.agent_id == cached.agent_id);
                if cached.score > self.config.confidence_threshold && still_candidate {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        task = %request.task_id,
                        agent = %cached.agent_id,
                        score = cached.score,
                        "routing cache hit"
                    );
                    return Some(cached.agent_id.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut best: Option<(&AgentSnapshot, f64)> = None;
        for candidate in candidates {
            let score = self.score(request.specialization, candidate);
            if score > 0.0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        let (winner, score) = match best {
            Some((agent, score)) => (agent.agent_id.clone(), score),
            None => (candidates[0].agent_id.clone(), 0.0),
        };
        debug!(
            task = %request.task_id,
            agent = %winner,
            score,
            candidates = candidates.len(),
            "agent selected"
        );

        let mut cache = self.cache.lock();
        self.evict_if_due(&mut cache);
        cache.entries.insert(
            key,
            CachedRoute {
                agent_id: winner.clone(),
                score,
            },
        );
        Some(winner)
    }

    fn evict_if_due(&self, cache: &mut RouteCache) {
        let full = cache.entries.len() >= self.config.cache_max_entries;
        let expired = cache.last_eviction.elapsed() >= self.config.cache_eviction_interval();
        if !full && !expired {
            return;
        }
        if !cache.entries.is_empty() {
            debug!(entries = cache.entries.len(), full, "routing cache evicted");
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        cache.entries.clear();
        cache.last_eviction = Instant::now();
    }

    /// Drop every cached decision.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        cache.entries.clear();
        cache.last_eviction = Instant::now();
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            cache_evictions: self.evictions.load(Ordering::Relaxed),
            cached_entries: self.cache.lock().entries.len(),
        }
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new(RoutingConfig::default())
    }
}
