//! Task dispatch to external agents.
//!
//! The agent pool that actually runs tasks sits behind the `TaskExecutor`
//! trait. `GroupRunner` dispatches one task group through it: at most
//! `max_parallel` tasks run at a time, queued tasks take the next free slot
//! in definition order, every dispatch is bounded by a soft timeout, and
//! `run` returns only once every dispatch of the group has resolved.

use crate::agent::{AgentId, Specialization};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::util::with_timeout;
use crate::workflow::WorkflowId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Execution context shared by every dispatch of a workflow run.
pub type ExecutionContext = HashMap<String, serde_json::Value>;

/// One task handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub specialization: Specialization,
    pub priority: u32,
    /// 1 for the first dispatch of the task.
    pub attempt: u32,
    pub context: Arc<ExecutionContext>,
}

/// What an agent reports for a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Quality in [0, 1].
    pub quality_score: f64,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl TaskOutcome {
    pub fn new(quality_score: f64) -> Self {
        Self {
            quality_score,
            output: None,
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// The agent pool, as seen by the coordinator.
///
/// Implementations run the task on `dispatch.agent_id` and resolve once it
/// has finished. An `Err` marks the task failed.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, dispatch: TaskDispatch) -> Result<TaskOutcome>;
}

/// How a single dispatch resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum DispatchResult {
    Completed { outcome: TaskOutcome },
    Failed { error: String },
    TimedOut { after: Duration },
}

/// Record of one resolved dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub result: DispatchResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Summary of one group barrier.
#[derive(Debug, Clone, Default)]
pub struct GroupReport {
    /// Reports in dispatch order.
    pub reports: Vec<DispatchReport>,
    /// Wall time from the first dispatch to the barrier.
    pub wall_time: Duration,
    /// Maximum number of dispatches that could run at once.
    pub concurrency: usize,
}

impl GroupReport {
    /// Sum of individual dispatch times.
    pub fn busy_time(&self) -> Duration {
        self.reports.iter().map(|r| r.elapsed).sum()
    }
}

/// Runs one task group with a bounded pool and a completion barrier.
pub struct GroupRunner {
    executor: Arc<dyn TaskExecutor>,
    max_parallel: usize,
    task_timeout: Duration,
}

impl GroupRunner {
    pub fn new(executor: Arc<dyn TaskExecutor>, max_parallel: usize, task_timeout: Duration) -> Self {
        Self {
            executor,
            max_parallel: max_parallel.max(1),
            task_timeout,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Dispatch every task and wait for all of them.
    ///
    /// `on_start` runs on the caller's task right before a dispatch is
    /// spawned, so it observes dispatches in order. `on_finish` runs inside
    /// the spawned task as soon as its dispatch resolves.
    pub async fn run<S, F>(
        &self,
        dispatches: Vec<TaskDispatch>,
        mut on_start: S,
        on_finish: F,
    ) -> Result<GroupReport>
    where
        S: FnMut(&TaskDispatch),
        F: Fn(&DispatchReport) + Send + Sync + 'static,
    {
        let concurrency = self.max_parallel.min(dispatches.len());
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let on_finish = Arc::new(on_finish);
        let group_started = Instant::now();
        let mut handles = Vec::with_capacity(dispatches.len());

        for dispatch in dispatches {
            // Wait for a slot before spawning so dispatch order is preserved.
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::TaskExecution(e.to_string()))?;

            on_start(&dispatch);
            debug!(
                workflow = %dispatch.workflow_id,
                task = %dispatch.task_id,
                agent = %dispatch.agent_id,
                attempt = dispatch.attempt,
                "task dispatched"
            );

            let key = (dispatch.task_id.clone(), dispatch.agent_id.clone());
            let (task_id, agent_id) = key.clone();
            let executor = Arc::clone(&self.executor);
            let on_finish = Arc::clone(&on_finish);
            let timeout = self.task_timeout;

            let handle = tokio::spawn(async move {
                let started_at = Utc::now();
                let clock = Instant::now();
                let result = match with_timeout(timeout, executor.execute(dispatch)).await {
                    Ok(outcome) => DispatchResult::Completed { outcome },
                    Err(Error::Timeout(after)) => DispatchResult::TimedOut { after },
                    Err(e) => DispatchResult::Failed {
                        error: e.to_string(),
                    },
                };
                let report = DispatchReport {
                    task_id,
                    agent_id,
                    result,
                    started_at,
                    finished_at: Utc::now(),
                    elapsed: clock.elapsed(),
                };
                on_finish(&report);
                drop(permit);
                report
            });
            handles.push((key, handle));
        }

        let (keys, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut reports = Vec::with_capacity(joined.len());
        for (result, key) in joined.into_iter().zip(keys) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(task = %key.0, error = %e, "dispatch task aborted");
                    let now = Utc::now();
                    let report = DispatchReport {
                        task_id: key.0,
                        agent_id: key.1,
                        result: DispatchResult::Failed {
                            error: Error::TaskJoin(e.to_string()).to_string(),
                        },
                        started_at: now,
                        finished_at: now,
                        elapsed: Duration::ZERO,
                    };
                    on_finish(&report);
                    reports.push(report);
                }
            }
        }

        Ok(GroupReport {
            reports,
            wall_time: group_started.elapsed(),
            concurrency,
        })
    }
}
