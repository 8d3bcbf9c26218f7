//! Workflow coordinator.
//!
//! The `WorkflowCoordinator` registers workflow definitions, turns them into
//! level-ordered task groups, and drives execution: every group is routed,
//! dispatched through the `TaskExecutor` with a bounded pool, and awaited as
//! a barrier before the next group starts. Tasks left blocked or waiting are
//! retried in sweep passes, and quality gates decide the final status.

use crate::agent::{AgentCapabilities, AgentHealth, AgentId};
use crate::config::Config;
use crate::core::dag::{DependencyGraph, ExecutionPlan};
use crate::core::task::{BlockReason, TaskId, TaskRuntimeState, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::dispatch::{
    DispatchReport, DispatchResult, ExecutionContext, GroupRunner, TaskDispatch, TaskExecutor,
};
use crate::orchestration::metrics::{
    CollectorHandle, CoordinationMetrics, CoordinationMetricsCollector, ExecutionTimings,
};
use crate::orchestration::quality::{QualityGate, QualityGateEvaluator};
use crate::orchestration::registry::AgentRegistry;
use crate::orchestration::router::{RoutingRequest, TaskRouter};
use crate::workflow::{WorkflowDefinition, WorkflowId, WorkflowRuntimeState, WorkflowStatus};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events emitted while workflows execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum CoordinatorEvent {
    WorkflowStarted {
        workflow_id: WorkflowId,
        execution_id: uuid::Uuid,
    },
    TaskDispatched {
        workflow_id: WorkflowId,
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskCompleted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        agent_id: AgentId,
        quality_score: f64,
    },
    TaskFailed {
        workflow_id: WorkflowId,
        task_id: TaskId,
        error: String,
    },
    TaskBlocked {
        workflow_id: WorkflowId,
        task_id: TaskId,
        reason: BlockReason,
    },
    /// A group barrier was reached.
    GroupCompleted {
        workflow_id: WorkflowId,
        level: usize,
        dispatched: usize,
    },
    GateEvaluated {
        workflow_id: WorkflowId,
        gate_id: String,
        passed: bool,
    },
    WorkflowFinished {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    },
}

/// Process-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationStatistics {
    pub workflows_registered: usize,
    pub workflows_executed: u64,
    pub tasks_dispatched: u64,
    /// Tasks dispatched in groups that ran more than one task at a time.
    pub parallel_tasks_executed: u64,
    pub quality_gates_passed: u64,
    pub quality_gates_failed: u64,
    pub active_workflows: usize,
    /// Task states retained across all runs.
    pub total_tasks: usize,
    pub registered_agents: usize,
}

/// A validated definition with its dependency graph and execution plan.
struct RegisteredWorkflow {
    definition: WorkflowDefinition,
    graph: DependencyGraph,
    plan: ExecutionPlan,
}

impl RegisteredWorkflow {
    fn fresh_tasks(&self) -> HashMap<TaskId, TaskRuntimeState> {
        let def = &self.definition;
        def.task_ids
            .iter()
            .map(|id| {
                let state = TaskRuntimeState::new(
                    def.workflow_id.clone(),
                    id.clone(),
                    def.specialization_for(id),
                    def.priority_for(id),
                    def.dependencies_of(id),
                );
                (id.clone(), state)
            })
            .collect()
    }
}

/// The definition's estimate as a signed duration, saturating on overflow.
fn estimated_duration(definition: &WorkflowDefinition) -> chrono::Duration {
    i64::try_from(definition.estimated_duration_minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .unwrap_or(chrono::Duration::MAX)
}

/// Runtime state of one execution.
struct WorkflowRun {
    state: WorkflowRuntimeState,
    tasks: HashMap<TaskId, TaskRuntimeState>,
    /// Definition order.
    order: Vec<TaskId>,
    timings: ExecutionTimings,
    cancel: CancellationToken,
    estimated_duration: chrono::Duration,
}

impl WorkflowRun {
    fn refresh(&mut self) {
        let tasks = &self.tasks;
        self.state.refresh(
            self.order.iter().filter_map(|id| tasks.get(id)),
            self.estimated_duration,
        );
    }

    fn ordered_tasks(&self) -> Vec<TaskRuntimeState> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    fn metrics(&self, registry: &AgentRegistry) -> CoordinationMetrics {
        let elapsed = self
            .state
            .finished_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.state.started_at)
            .to_std()
            .unwrap_or_default();
        CoordinationMetrics::compute(
            self.order.iter().filter_map(|id| self.tasks.get(id)),
            &self.timings,
            elapsed,
            registry,
        )
    }
}

/// State shared with dispatch callbacks and the metrics collector.
struct Shared {
    config: Config,
    registry: AgentRegistry,
    router: TaskRouter,
    gates: QualityGateEvaluator,
    workflows: RwLock<HashMap<WorkflowId, Arc<RegisteredWorkflow>>>,
    runs: RwLock<HashMap<WorkflowId, Arc<RwLock<WorkflowRun>>>>,
    events: broadcast::Sender<CoordinatorEvent>,
    workflows_executed: AtomicU64,
    tasks_dispatched: AtomicU64,
    parallel_tasks_executed: AtomicU64,
}

impl Shared {
    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn refresh_active_metrics(&self) {
        let runs: Vec<_> = self.runs.read().values().cloned().collect();
        for run in runs {
            let mut run = run.write();
            if !run.state.status.is_active() {
                continue;
            }
            run.refresh();
            let metrics = run.metrics(&self.registry);
            run.state.metrics = Some(metrics);
        }
    }

    /// Apply a resolved dispatch to the task, the agent record and the event stream.
    fn finish_dispatch(&self, run: &RwLock<WorkflowRun>, report: &DispatchReport) {
        self.registry.finish_task(&report.agent_id);

        let (score, event) = {
            let mut run = run.write();
            let workflow_id = run.state.workflow_id.clone();
            let Some(task) = run.tasks.get_mut(&report.task_id) else {
                return;
            };

            match &report.result {
                DispatchResult::Completed { outcome } => {
                    if let Err(e) = task.complete(outcome.quality_score, report.finished_at) {
                        warn!(task = %report.task_id, error = %e, "could not complete task");
                    }
                    info!(
                        workflow = %workflow_id,
                        task = %report.task_id,
                        agent = %report.agent_id,
                        quality = task.quality_score,
                        "task completed"
                    );
                    (
                        task.quality_score,
                        CoordinatorEvent::TaskCompleted {
                            workflow_id,
                            task_id: report.task_id.clone(),
                            agent_id: report.agent_id.clone(),
                            quality_score: task.quality_score,
                        },
                    )
                }
                DispatchResult::TimedOut { after } => {
                    let error = Error::TaskTimeout {
                        task_id: report.task_id.clone(),
                        after: *after,
                    }
                    .to_string();
                    if let Err(e) = task.fail(&error, report.finished_at) {
                        warn!(task = %report.task_id, error = %e, "could not fail task");
                    }
                    warn!(workflow = %workflow_id, task = %report.task_id, ?after, "task timed out");
                    (
                        self.config.registry.timeout_penalty_score,
                        CoordinatorEvent::TaskFailed {
                            workflow_id,
                            task_id: report.task_id.clone(),
                            error,
                        },
                    )
                }
                DispatchResult::Failed { error } => {
                    if let Err(e) = task.fail(error, report.finished_at) {
                        warn!(task = %report.task_id, error = %e, "could not fail task");
                    }
                    warn!(workflow = %workflow_id, task = %report.task_id, %error, "task failed");
                    (
                        self.config.registry.failure_score,
                        CoordinatorEvent::TaskFailed {
                            workflow_id,
                            task_id: report.task_id.clone(),
                            error: error.clone(),
                        },
                    )
                }
            }
        };

        if let Err(e) = self.registry.record_performance(&report.agent_id, score) {
            debug!(agent = %report.agent_id, error = %e, "performance not recorded");
        }
        self.emit(event);
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    collector: Option<CollectorHandle>,
}

/// Orchestrates workflow execution across registered agents.
pub struct WorkflowCoordinator {
    shared: Arc<Shared>,
    executor: Arc<dyn TaskExecutor>,
    running: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkflowCoordinator {
    pub fn new(config: Config, executor: Arc<dyn TaskExecutor>) -> Self {
        let (events, _) = broadcast::channel(config.coordinator.event_capacity.max(1));
        let shared = Shared {
            registry: AgentRegistry::new(config.registry.clone()),
            router: TaskRouter::new(config.routing.clone()),
            gates: QualityGateEvaluator::new(),
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            events,
            workflows_executed: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            parallel_tasks_executed: AtomicU64::new(0),
            config,
        };
        Self {
            shared: Arc::new(shared),
            executor,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                cancel: CancellationToken::new(),
                collector: None,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.shared.registry
    }

    pub fn router(&self) -> &TaskRouter {
        &self.shared.router
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::CoordinatorNotRunning)
        }
    }

    /// Start accepting operations and spawn the metrics collector.
    ///
    /// Must be called from within a Tokio runtime. Starting a running
    /// coordinator is a no-op.
    pub fn start(&self) -> Result<()> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| Error::TaskExecution(format!("coordinator needs a tokio runtime: {e}")))?;

        let mut lifecycle = self.lifecycle.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        lifecycle.cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let collector = CoordinationMetricsCollector::new(self.shared.config.metrics.collection_interval())
            .spawn(lifecycle.cancel.child_token(), move || shared.refresh_active_metrics());
        lifecycle.collector = Some(collector);

        info!("coordinator started");
        Ok(())
    }

    /// Stop accepting operations.
    ///
    /// Running workflows are cancelled at their next group barrier.
    pub async fn stop(&self) -> Result<()> {
        let collector = {
            let mut lifecycle = self.lifecycle.lock();
            if !self.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            lifecycle.cancel.cancel();
            lifecycle.collector.take()
        };
        if let Some(collector) = collector {
            collector.shutdown().await?;
        }
        info!("coordinator stopped");
        Ok(())
    }

    /// Receive coordinator events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.events.subscribe()
    }

    // -- agents ---------------------------------------------------------

    pub fn register_agent(&self, agent_id: AgentId, capabilities: AgentCapabilities) -> Result<()> {
        self.ensure_running()?;
        self.shared.registry.register(agent_id, capabilities)
    }

    pub fn unregister_agent(&self, agent_id: &AgentId) -> Result<()> {
        self.ensure_running()?;
        self.shared.registry.unregister(agent_id)
    }

    /// Record health and external load reported by the agent-pool manager.
    pub fn report_agent_health(&self, agent_id: &AgentId, health: AgentHealth, load: usize) -> Result<()> {
        self.ensure_running()?;
        self.shared.registry.report_health(agent_id, health, load)
    }

    // -- workflow registration ------------------------------------------

    /// Validate and store a workflow definition.
    ///
    /// # Errors
    /// - `Error::Validation` for an empty or inconsistent definition
    /// - `Error::CyclicDependency` if the dependencies contain a cycle
    /// - `Error::WorkflowExists` if the id is already registered
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.ensure_running()?;
        definition.validate()?;

        let graph = DependencyGraph::build(&definition)?;
        if let Some(cycle) = graph.find_cycle() {
            warn!(workflow = %definition.workflow_id, "rejected cyclic workflow");
            return Err(Error::CyclicDependency { cycle });
        }
        let plan = graph.without_soft_dependencies().execution_plan()?;

        let mut workflows = self.shared.workflows.write();
        if workflows.contains_key(&definition.workflow_id) {
            return Err(Error::WorkflowExists(definition.workflow_id));
        }

        info!(
            workflow = %definition.workflow_id,
            tasks = definition.task_ids.len(),
            groups = plan.groups.len(),
            parallel_groups = plan.parallel_groups().count(),
            "workflow registered"
        );
        workflows.insert(
            definition.workflow_id.clone(),
            Arc::new(RegisteredWorkflow {
                definition,
                graph,
                plan,
            }),
        );
        Ok(())
    }

    fn workflow(&self, workflow_id: &WorkflowId) -> Result<Arc<RegisteredWorkflow>> {
        self.shared
            .workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.clone()))
    }

    fn run(&self, workflow_id: &WorkflowId) -> Option<Arc<RwLock<WorkflowRun>>> {
        self.shared.runs.read().get(workflow_id).cloned()
    }

    /// The registered definition of a workflow.
    pub fn get_workflow_definition(&self, workflow_id: &WorkflowId) -> Result<WorkflowDefinition> {
        self.ensure_running()?;
        Ok(self.workflow(workflow_id)?.definition.clone())
    }

    /// Level-ordered task groups the workflow executes in.
    pub fn get_execution_plan(&self, workflow_id: &WorkflowId) -> Result<ExecutionPlan> {
        self.ensure_running()?;
        Ok(self.workflow(workflow_id)?.plan.clone())
    }

    /// Structural dependency level of a task, soft dependencies included.
    pub fn task_level(&self, workflow_id: &WorkflowId, task_id: &TaskId) -> Result<usize> {
        self.ensure_running()?;
        self.workflow(workflow_id)?.graph.level(task_id)
    }

    pub fn unregister_workflow(&self, workflow_id: &WorkflowId) -> Result<()> {
        self.ensure_running()?;
        self.ensure_not_active(workflow_id)?;
        if self.shared.workflows.write().remove(workflow_id).is_none() {
            return Err(Error::WorkflowNotFound(workflow_id.clone()));
        }
        self.shared.runs.write().remove(workflow_id);
        let gates = self.shared.gates.remove_workflow(workflow_id);
        info!(workflow = %workflow_id, gates, "workflow unregistered");
        Ok(())
    }

    /// Drop retained runtime state so `get_workflow_state` reports the
    /// registered placeholder again.
    pub fn clear_workflow(&self, workflow_id: &WorkflowId) -> Result<()> {
        self.ensure_running()?;
        self.workflow(workflow_id)?;
        self.ensure_not_active(workflow_id)?;
        self.shared.runs.write().remove(workflow_id);
        debug!(workflow = %workflow_id, "workflow runtime state cleared");
        Ok(())
    }

    fn ensure_not_active(&self, workflow_id: &WorkflowId) -> Result<()> {
        if let Some(run) = self.run(workflow_id) {
            if run.read().state.status.is_active() {
                return Err(Error::WorkflowAlreadyRunning(workflow_id.clone()));
            }
        }
        Ok(())
    }

    /// Request cancellation at the next group barrier.
    ///
    /// Returns false when the workflow has no active run.
    pub fn cancel_workflow(&self, workflow_id: &WorkflowId) -> Result<bool> {
        self.ensure_running()?;
        self.workflow(workflow_id)?;
        let Some(run) = self.run(workflow_id) else {
            return Ok(false);
        };
        let run = run.read();
        if !run.state.status.is_active() {
            return Ok(false);
        }
        run.cancel.cancel();
        info!(workflow = %workflow_id, "workflow cancellation requested");
        Ok(true)
    }

    // -- execution --------------------------------------------------------

    fn max_parallel_for(&self, definition: &WorkflowDefinition) -> usize {
        if !definition.parallel_execution {
            1
        } else if definition.max_parallel_tasks == 0 {
            self.shared.config.coordinator.default_max_parallel_tasks.max(1)
        } else {
            definition.max_parallel_tasks
        }
    }

    /// Soft timeout of a single dispatch.
    ///
    /// The workflow's duration estimate spread over its tasks, with slack;
    /// the configured default when there is no estimate.
    pub fn task_timeout_for(&self, definition: &WorkflowDefinition) -> Duration {
        let coordinator = &self.shared.config.coordinator;
        if definition.estimated_duration_minutes == 0 || definition.task_ids.is_empty() {
            return coordinator.default_task_timeout();
        }
        let secs = definition.estimated_duration_minutes as f64 * 60.0 * coordinator.task_timeout_factor
            / definition.task_ids.len() as f64;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Execute a registered workflow to completion.
    ///
    /// Returns the final runtime state. Task failures are recorded in the
    /// state rather than returned as errors.
    pub async fn execute_workflow(
        &self,
        workflow_id: &WorkflowId,
        context: ExecutionContext,
    ) -> Result<WorkflowRuntimeState> {
        self.ensure_running()?;
        let registered = self.workflow(workflow_id)?;
        let definition = &registered.definition;

        let cancel = self.lifecycle.lock().cancel.child_token();
        let run = {
            let mut runs = self.shared.runs.write();
            if let Some(existing) = runs.get(workflow_id) {
                if existing.read().state.status.is_active() {
                    return Err(Error::WorkflowAlreadyRunning(workflow_id.clone()));
                }
            }
            let run = Arc::new(RwLock::new(WorkflowRun {
                state: WorkflowRuntimeState::new(workflow_id.clone()),
                tasks: registered.fresh_tasks(),
                order: definition.task_ids.clone(),
                timings: ExecutionTimings::default(),
                cancel,
                estimated_duration: estimated_duration(definition),
            }));
            runs.insert(workflow_id.clone(), Arc::clone(&run));
            run
        };

        self.shared.workflows_executed.fetch_add(1, Ordering::Relaxed);
        let execution_id = {
            let mut run = run.write();
            run.refresh();
            run.state.execution_id
        };
        info!(workflow = %workflow_id, %execution_id, "workflow execution started");
        self.shared.emit(CoordinatorEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            execution_id,
        });

        let runner = GroupRunner::new(
            Arc::clone(&self.executor),
            self.max_parallel_for(definition),
            self.task_timeout_for(definition),
        );
        let context = Arc::new(context);

        let cancelled = match self.drive(&registered, &run, &runner, &context).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(workflow = %workflow_id, error = %e, "workflow execution aborted");
                self.finish(&run, WorkflowStatus::Failed);
                return Err(e);
            }
        };

        let gates_passed = if cancelled {
            false
        } else {
            self.evaluate_gates(workflow_id, &run)
        };

        let status = {
            let run = run.read();
            let all_completed = run.tasks.values().all(|t| t.status == TaskStatus::Completed);
            if cancelled {
                WorkflowStatus::Cancelled
            } else if all_completed && gates_passed {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            }
        };
        Ok(self.finish(&run, status))
    }

    /// Run every level group, then the retry sweep. Returns whether the run
    /// was cancelled.
    async fn drive(
        &self,
        registered: &RegisteredWorkflow,
        run: &Arc<RwLock<WorkflowRun>>,
        runner: &GroupRunner,
        context: &Arc<ExecutionContext>,
    ) -> Result<bool> {
        for group in &registered.plan.groups {
            if run.read().cancel.is_cancelled() {
                return Ok(true);
            }
            let dispatched = self
                .schedule_pass(registered, run, &group.task_ids, runner, context)
                .await?;
            self.shared.emit(CoordinatorEvent::GroupCompleted {
                workflow_id: registered.definition.workflow_id.clone(),
                level: group.level,
                dispatched,
            });
        }

        let ordered = registered.plan.ordered_task_ids();
        let coordinator = &self.shared.config.coordinator;
        let mut idle_passes = 0;
        while idle_passes < coordinator.max_retry_passes {
            if run.read().cancel.is_cancelled() {
                return Ok(true);
            }
            let pending: Vec<TaskId> = {
                let run = run.read();
                ordered
                    .iter()
                    .filter(|id| run.tasks.get(*id).is_some_and(|t| !t.status.is_final()))
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                break;
            }

            debug!(
                workflow = %registered.definition.workflow_id,
                tasks = pending.len(),
                idle_passes,
                "retry sweep"
            );
            let dispatched = self
                .schedule_pass(registered, run, &pending, runner, context)
                .await?;
            if dispatched > 0 {
                idle_passes = 0;
            } else {
                idle_passes += 1;
                // Give the pool manager a chance to report recovered agents.
                tokio::time::sleep(coordinator.retry_backoff()).await;
            }
        }

        // Anything still unresolved cannot make progress.
        let mut run = run.write();
        let workflow_id = run.state.workflow_id.clone();
        for id in ordered {
            let Some(task) = run.tasks.get(&id) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            let reason = task
                .blocking_dependencies()
                .find(|dep| {
                    run.tasks
                        .get(*dep)
                        .is_some_and(|t| t.status != TaskStatus::Completed)
                })
                .map(|dep| BlockReason::DependencyFailed {
                    dependency: dep.clone(),
                })
                .unwrap_or(BlockReason::NoAgentAvailable);

            let Some(task) = run.tasks.get_mut(&id) else {
                continue;
            };
            if task.block(reason.clone()).is_ok() {
                self.shared.emit(CoordinatorEvent::TaskBlocked {
                    workflow_id: workflow_id.clone(),
                    task_id: id,
                    reason,
                });
            }
        }
        Ok(run.cancel.is_cancelled())
    }

    /// Route and dispatch the ready tasks among `task_ids`, then wait for
    /// all of them. Returns the number of dispatched tasks.
    async fn schedule_pass(
        &self,
        registered: &RegisteredWorkflow,
        run: &Arc<RwLock<WorkflowRun>>,
        task_ids: &[TaskId],
        runner: &GroupRunner,
        context: &Arc<ExecutionContext>,
    ) -> Result<usize> {
        let workflow_id = &registered.definition.workflow_id;
        let dispatches = {
            let mut run = run.write();
            self.prepare_dispatches(&mut run, task_ids, context)
        };
        if dispatches.is_empty() {
            return Ok(0);
        }

        {
            let mut run = run.write();
            if run.state.status == WorkflowStatus::Initializing {
                run.state.transition(WorkflowStatus::Executing)?;
                info!(workflow = %workflow_id, "workflow executing");
            }
        }

        let count = dispatches.len();
        self.shared
            .tasks_dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 1 && runner.max_parallel() > 1 {
            self.shared
                .parallel_tasks_executed
                .fetch_add(count as u64, Ordering::Relaxed);
        }

        let shared = Arc::clone(&self.shared);
        let finish_run = Arc::clone(run);
        let report = runner
            .run(
                dispatches,
                |dispatch| {
                    if let Err(e) = self.shared.registry.begin_task(&dispatch.agent_id) {
                        debug!(agent = %dispatch.agent_id, error = %e, "dispatching to unregistered agent");
                    }
                    if let Some(task) = run.write().tasks.get_mut(&dispatch.task_id) {
                        if let Err(e) = task.start() {
                            warn!(task = %dispatch.task_id, error = %e, "could not start task");
                        }
                    }
                    self.shared.emit(CoordinatorEvent::TaskDispatched {
                        workflow_id: dispatch.workflow_id.clone(),
                        task_id: dispatch.task_id.clone(),
                        agent_id: dispatch.agent_id.clone(),
                    });
                },
                move |report| shared.finish_dispatch(&finish_run, report),
            )
            .await?;

        let mut run = run.write();
        run.timings.record_group(&report);
        run.refresh();
        debug!(
            workflow = %workflow_id,
            dispatched = count,
            wall_ms = report.wall_time.as_millis() as u64,
            progress = run.state.progress_percent,
            "group barrier reached"
        );
        Ok(count)
    }

    /// Settle readiness for `task_ids` and route every ready task.
    fn prepare_dispatches(
        &self,
        run: &mut WorkflowRun,
        task_ids: &[TaskId],
        context: &Arc<ExecutionContext>,
    ) -> Vec<TaskDispatch> {
        let workflow_id = run.state.workflow_id.clone();
        let mut dispatches = Vec::new();

        for id in task_ids {
            let Some(task) = run.tasks.get(id) else {
                continue;
            };
            if task.status.is_final() || task.status.is_active() {
                continue;
            }

            let mut failed_dependency = None;
            let mut ready = true;
            for dep in task.blocking_dependencies() {
                match run.tasks.get(dep).map(|t| &t.status) {
                    Some(TaskStatus::Completed) => {}
                    Some(status) if status.is_final() => {
                        failed_dependency = Some(dep.clone());
                        break;
                    }
                    _ => ready = false,
                }
            }

            let Some(task) = run.tasks.get_mut(id) else {
                continue;
            };

            if let Some(dependency) = failed_dependency {
                let reason = BlockReason::DependencyFailed { dependency };
                if task.block(reason.clone()).is_ok() {
                    info!(workflow = %workflow_id, task = %id, %reason, "task blocked");
                    self.shared.emit(CoordinatorEvent::TaskBlocked {
                        workflow_id: workflow_id.clone(),
                        task_id: id.clone(),
                        reason,
                    });
                }
                continue;
            }

            if !ready {
                if task.status != TaskStatus::WaitingDependency {
                    let _ = task.mark_waiting();
                }
                continue;
            }

            if task.status != TaskStatus::Ready {
                if let Err(e) = task.mark_ready() {
                    warn!(task = %id, error = %e, "could not mark task ready");
                    continue;
                }
            }

            let Some(agent_id) = self.route(task) else {
                let reason = BlockReason::NoAgentAvailable;
                if task.block(reason.clone()).is_ok() {
                    warn!(workflow = %workflow_id, task = %id, "no agent available");
                    self.shared.emit(CoordinatorEvent::TaskBlocked {
                        workflow_id: workflow_id.clone(),
                        task_id: id.clone(),
                        reason,
                    });
                }
                continue;
            };

            if let Err(e) = self.shared.registry.reserve_task(&agent_id) {
                warn!(task = %id, agent = %agent_id, error = %e, "agent vanished before dispatch");
                let _ = task.block(BlockReason::NoAgentAvailable);
                continue;
            }
            if let Err(e) = task.assign(agent_id.clone()) {
                self.shared.registry.release_reservation(&agent_id);
                warn!(task = %id, error = %e, "could not assign task");
                continue;
            }

            dispatches.push(TaskDispatch {
                workflow_id: workflow_id.clone(),
                task_id: id.clone(),
                agent_id,
                specialization: task.required_specialization,
                priority: task.priority,
                attempt: task.attempts + 1,
                context: Arc::clone(context),
            });
        }
        dispatches
    }

    /// Pick an agent for a ready task.
    ///
    /// Agents with the required specialization are preferred; any available
    /// agent is considered when none of them is free.
    fn route(&self, task: &TaskRuntimeState) -> Option<AgentId> {
        let registry = &self.shared.registry;
        let mut candidates = registry.list_available(Some(task.required_specialization));
        if candidates.is_empty() {
            candidates = registry.list_available(None);
        }
        let request = RoutingRequest::new(task.task_id.clone(), task.required_specialization);
        self.shared.router.select_agent(&request, &candidates)
    }

    /// Evaluate every gate of the workflow. True when all blocking gates pass.
    fn evaluate_gates(&self, workflow_id: &WorkflowId, run: &RwLock<WorkflowRun>) -> bool {
        let tasks = run.read().tasks.clone();
        let mut blocking_passed = true;
        for gate in self.shared.gates.gates_for(workflow_id) {
            let passed = match self.shared.gates.evaluate(&gate.gate_id, &tasks) {
                Ok(passed) => passed,
                Err(e) => {
                    warn!(gate = %gate.gate_id, error = %e, "quality gate evaluation failed");
                    false
                }
            };
            if gate.blocking && !passed {
                blocking_passed = false;
            }
            self.shared.emit(CoordinatorEvent::GateEvaluated {
                workflow_id: workflow_id.clone(),
                gate_id: gate.gate_id,
                passed,
            });
        }
        blocking_passed
    }

    fn finish(&self, run: &RwLock<WorkflowRun>, status: WorkflowStatus) -> WorkflowRuntimeState {
        let mut run = run.write();
        if let Err(e) = run.state.transition(status) {
            warn!(workflow = %run.state.workflow_id, error = %e, "unexpected final transition");
        }
        run.refresh();
        let metrics = run.metrics(&self.shared.registry);
        run.state.metrics = Some(metrics);

        info!(
            workflow = %run.state.workflow_id,
            %status,
            completed = run.state.completed_task_ids.len(),
            failed = run.state.failed_task_ids.len(),
            blocked = run.state.blocked_task_ids.len(),
            "workflow execution finished"
        );
        self.shared.emit(CoordinatorEvent::WorkflowFinished {
            workflow_id: run.state.workflow_id.clone(),
            status,
        });
        run.state.clone()
    }

    // -- queries ------------------------------------------------------------

    /// Whether every blocking dependency of the task has completed.
    ///
    /// Before the workflow has run, only tasks without blocking
    /// dependencies are ready.
    pub fn is_task_ready(&self, workflow_id: &WorkflowId, task_id: &TaskId) -> Result<bool> {
        self.ensure_running()?;
        let registered = self.workflow(workflow_id)?;
        if !registered.definition.contains_task(task_id) {
            return Err(Error::Validation(format!(
                "workflow {} has no task {}",
                workflow_id, task_id
            )));
        }

        let Some(run) = self.run(workflow_id) else {
            return Ok(!registered.definition.has_blocking_dependency(task_id));
        };
        let run = run.read();
        let Some(task) = run.tasks.get(task_id) else {
            return Ok(false);
        };
        let ready = task
            .blocking_dependencies()
            .all(|dep| run.tasks.get(dep).is_some_and(|t| t.status == TaskStatus::Completed));
        Ok(ready)
    }

    /// Latest runtime state, or a `registered` placeholder if the workflow
    /// has not run.
    pub fn get_workflow_state(&self, workflow_id: &WorkflowId) -> Result<WorkflowRuntimeState> {
        self.ensure_running()?;
        self.workflow(workflow_id)?;
        match self.run(workflow_id) {
            Some(run) => {
                let mut run = run.write();
                run.refresh();
                Ok(run.state.clone())
            }
            None => Ok(WorkflowRuntimeState::registered(workflow_id.clone())),
        }
    }

    /// Task states in definition order.
    pub fn get_task_states(&self, workflow_id: &WorkflowId) -> Result<Vec<TaskRuntimeState>> {
        self.ensure_running()?;
        let registered = self.workflow(workflow_id)?;
        match self.run(workflow_id) {
            Some(run) => Ok(run.read().ordered_tasks()),
            None => {
                let mut fresh = registered.fresh_tasks();
                Ok(registered
                    .definition
                    .task_ids
                    .iter()
                    .filter_map(|id| fresh.remove(id))
                    .collect())
            }
        }
    }

    pub fn get_coordination_metrics(&self, workflow_id: &WorkflowId) -> Result<CoordinationMetrics> {
        self.ensure_running()?;
        let registered = self.workflow(workflow_id)?;
        match self.run(workflow_id) {
            Some(run) => Ok(run.read().metrics(&self.shared.registry)),
            None => {
                let tasks = registered.fresh_tasks();
                Ok(CoordinationMetrics::compute(
                    tasks.values(),
                    &ExecutionTimings::default(),
                    Duration::ZERO,
                    &self.shared.registry,
                ))
            }
        }
    }

    pub fn get_coordination_statistics(&self) -> Result<CoordinationStatistics> {
        self.ensure_running()?;
        let shared = &self.shared;
        let (active_workflows, total_tasks) = shared
            .runs
            .read()
            .values()
            .fold((0, 0), |(active, total), run| {
                let run = run.read();
                (
                    active + usize::from(run.state.status.is_active()),
                    total + run.tasks.len(),
                )
            });

        Ok(CoordinationStatistics {
            workflows_registered: shared.workflows.read().len(),
            workflows_executed: shared.workflows_executed.load(Ordering::Relaxed),
            tasks_dispatched: shared.tasks_dispatched.load(Ordering::Relaxed),
            parallel_tasks_executed: shared.parallel_tasks_executed.load(Ordering::Relaxed),
            quality_gates_passed: shared.gates.passed_count(),
            quality_gates_failed: shared.gates.failed_count(),
            active_workflows,
            total_tasks,
            registered_agents: shared.registry.len(),
        })
    }

    // -- quality gates --------------------------------------------------------

    /// Register a gate for a registered workflow.
    pub fn register_quality_gate(&self, gate: QualityGate) -> Result<()> {
        self.ensure_running()?;
        let registered = self.workflow(&gate.workflow_id)?;
        if let Some(unknown) = gate
            .required_task_ids
            .iter()
            .find(|id| !registered.definition.contains_task(id))
        {
            return Err(Error::Validation(format!(
                "gate {} references unknown task {}",
                gate.gate_id, unknown
            )));
        }
        debug!(gate = %gate.gate_id, workflow = %gate.workflow_id, "quality gate registered");
        self.shared.gates.register(gate)
    }

    pub fn get_quality_gate(&self, gate_id: &str) -> Result<QualityGate> {
        self.ensure_running()?;
        self.shared.gates.get(gate_id)
    }

    /// Evaluate a gate against the current task states of its workflow.
    pub fn validate_quality_gate(&self, gate_id: &str) -> Result<bool> {
        self.ensure_running()?;
        let gate = self.shared.gates.get(gate_id)?;
        let registered = self.workflow(&gate.workflow_id)?;
        let tasks = match self.run(&gate.workflow_id) {
            Some(run) => run.read().tasks.clone(),
            None => registered.fresh_tasks(),
        };

        let passed = self.shared.gates.evaluate(gate_id, &tasks)?;
        self.shared.emit(CoordinatorEvent::GateEvaluated {
            workflow_id: gate.workflow_id,
            gate_id: gate.gate_id,
            passed,
        });
        Ok(passed)
    }
}
