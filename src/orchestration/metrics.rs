//! Coordination metrics.
//!
//! Metrics are derived from a run's task states, its group timings and the
//! registry's live load. `CoordinationMetricsCollector` recomputes them on a
//! fixed cadence in a background task.

use crate::core::task::{TaskRuntimeState, TaskStatus};
use crate::orchestration::dispatch::GroupReport;
use crate::orchestration::registry::AgentRegistry;
use crate::util::mean;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Snapshot of how well a workflow run is being coordinated.
///
/// Every ratio lies in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMetrics {
    /// Completed tasks over all tasks.
    pub completion_rate: f64,
    /// Busy agent time over the capacity offered by the group pools.
    pub parallel_efficiency: f64,
    /// `1 / (1 + CV)` of tasks assigned per agent.
    pub task_distribution_balance: f64,
    /// Mean quality of completed tasks.
    pub quality_consistency: f64,
    /// Share of elapsed time spent outside group dispatch.
    pub coordination_overhead: f64,
    /// Active tasks over capacity across routable agents.
    pub agent_utilization: f64,
    pub collected_at: DateTime<Utc>,
}

/// Accumulated group timings of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTimings {
    /// Sum of task execution times.
    pub busy_time: Duration,
    /// Sum of group wall time multiplied by group concurrency.
    pub capacity_time: Duration,
    /// Sum of group wall times.
    pub dispatch_time: Duration,
    pub groups: usize,
}

impl ExecutionTimings {
    pub fn record_group(&mut self, report: &GroupReport) {
        self.busy_time += report.busy_time();
        self.capacity_time += report.wall_time * report.concurrency as u32;
        self.dispatch_time += report.wall_time;
        self.groups += 1;
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        0.0
    } else {
        (numerator / denominator).clamp(0.0, 1.0)
    }
}

/// `1 / (1 + coefficient of variation)`; 1.0 for fewer than two samples.
fn balance(counts: &[f64]) -> f64 {
    if counts.len() < 2 {
        return 1.0;
    }
    let Some(avg) = mean(counts.iter().copied()) else {
        return 1.0;
    };
    if avg <= 0.0 {
        return 1.0;
    }
    let variance = counts.iter().map(|c| (c - avg).powi(2)).sum::<f64>() / counts.len() as f64;
    1.0 / (1.0 + variance.sqrt() / avg)
}

impl CoordinationMetrics {
    /// Derive metrics for one run.
    ///
    /// `elapsed` is the run's wall time so far.
    pub fn compute<'a, I>(
        tasks: I,
        timings: &ExecutionTimings,
        elapsed: Duration,
        registry: &AgentRegistry,
    ) -> Self
    where
        I: IntoIterator<Item = &'a TaskRuntimeState>,
    {
        let mut total = 0usize;
        let mut completed = 0usize;
        let mut qualities = Vec::new();
        let mut per_agent: HashMap<&str, f64> = HashMap::new();

        for task in tasks {
            total += 1;
            if task.status == TaskStatus::Completed {
                completed += 1;
                qualities.push(task.quality_score);
            }
            let dispatched = task.status.is_active()
                || matches!(task.status, TaskStatus::Completed | TaskStatus::Failed { .. });
            if let (true, Some(agent)) = (dispatched, task.assigned_agent_id.as_ref()) {
                *per_agent.entry(agent.as_str()).or_default() += 1.0;
            }
        }

        let counts: Vec<f64> = per_agent.into_values().collect();

        let (active, capacity) = registry
            .list_all()
            .iter()
            .filter(|agent| agent.health.is_routable())
            .fold((0usize, 0usize), |(active, capacity), agent| {
                (active + agent.active_tasks, capacity + agent.max_concurrent_tasks)
            });

        Self {
            completion_rate: ratio(completed as f64, total as f64),
            parallel_efficiency: ratio(
                timings.busy_time.as_secs_f64(),
                timings.capacity_time.as_secs_f64(),
            ),
            task_distribution_balance: balance(&counts),
            quality_consistency: mean(qualities).unwrap_or(0.0),
            coordination_overhead: if elapsed.is_zero() {
                0.0
            } else {
                1.0 - ratio(timings.dispatch_time.as_secs_f64(), elapsed.as_secs_f64())
            },
            agent_utilization: ratio(active as f64, capacity as f64),
            collected_at: Utc::now(),
        }
    }
}

/// Handle to a running collector.
pub struct CollectorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    /// Stop the collector and wait for its task to exit.
    pub async fn shutdown(self) -> crate::Result<()> {
        self.cancel.cancel();
        crate::util::join(self.task).await
    }
}

/// Periodically invokes a refresh callback until cancelled.
pub struct CoordinationMetricsCollector {
    interval: Duration,
}

impl CoordinationMetricsCollector {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Spawn the collection loop. `cancel` also stops it when a parent
    /// token is cancelled.
    pub fn spawn<F>(self, cancel: CancellationToken, refresh: F) -> CollectorHandle
    where
        F: Fn() + Send + 'static,
    {
        let token = cancel.clone();

        debug!(interval_ms = self.interval.as_millis() as u64, "metrics collector started");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("metrics collector stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        refresh();
                        trace!("metrics collected");
                    }
                }
            }
        });

        CollectorHandle { cancel, task }
    }
}
