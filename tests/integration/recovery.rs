//! Failure handling and recovery tests.
//!
//! These tests verify that per-task failures are absorbed into workflow
//! state, that blocked tasks are surfaced with a reason, that retry sweeps
//! pick up recovered agents, and that validation and lifecycle errors fail
//! fast at the API boundary.

use std::sync::Arc;
use std::time::Duration;

use conductor::agent::{AgentCapabilities, AgentHealth, AgentId, Specialization};
use conductor::core::task::{BlockReason, TaskId, TaskRuntimeState, TaskStatus};
use conductor::orchestration::{
    ExecutionContext, GateStatus, QualityGate, WorkflowCoordinator,
};
use conductor::workflow::{
    WorkflowDefinition, WorkflowId, WorkflowStatus, MAX_ESTIMATED_DURATION_MINUTES,
};
use conductor::Error;

use crate::fixtures::{
    add_agent, ids, started_coordinator, started_coordinator_with, test_config,
    RecordingExecutor,
};

fn task<'a>(tasks: &'a [TaskRuntimeState], id: &str) -> &'a TaskRuntimeState {
    tasks
        .iter()
        .find(|t| t.task_id.as_str() == id)
        .unwrap_or_else(|| panic!("no task {}", id))
}

/// Test: Task timeout
/// Given a task that outlives the per-task timeout
/// When the workflow executes
/// Then the task fails with a timeout, its agent is penalized,
/// and its blocking dependent is blocked
#[tokio::test]
async fn test_timeout_fails_task_and_penalizes_agent() {
    let executor = Arc::new(RecordingExecutor::new().with_delay("slow", 2_000));
    let mut config = test_config();
    config.coordinator.default_task_timeout_ms = 50;
    let coordinator = started_coordinator_with(config, executor);
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(
            WorkflowDefinition::new("wf", ["slow", "after", "side"]).blocking("after", "slow"),
        )
        .unwrap();

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(ids(&state.failed_task_ids), vec!["slow"]);
    assert_eq!(ids(&state.blocked_task_ids), vec!["after"]);
    assert_eq!(ids(&state.completed_task_ids), vec!["side"]);

    let tasks = coordinator.get_task_states(&wf).unwrap();
    match &task(&tasks, "slow").status {
        TaskStatus::Failed { error } => assert!(error.contains("timed out"), "{}", error),
        other => panic!("expected failed, got {}", other),
    }
    assert_eq!(
        task(&tasks, "after").status,
        TaskStatus::Blocked {
            reason: BlockReason::DependencyFailed {
                dependency: TaskId::from("slow")
            }
        }
    );

    let record = coordinator.registry().record(&AgentId::from("gen1")).unwrap();
    assert!(record.performance_history.contains(&0.1));
}

/// Test: Executor failure
/// Given a task whose agent reports an error
/// When the workflow executes
/// Then the blocking dependent is blocked, the soft dependent still runs,
/// and the workflow fails
#[tokio::test]
async fn test_failure_blocks_only_blocking_dependents() {
    let executor = Arc::new(RecordingExecutor::new().failing("a"));
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(
            WorkflowDefinition::new("wf", ["a", "b", "c"])
                .blocking("b", "a")
                .soft("c", "a"),
        )
        .unwrap();

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(ids(&state.failed_task_ids), vec!["a"]);
    assert_eq!(ids(&state.blocked_task_ids), vec!["b"]);
    assert_eq!(ids(&state.completed_task_ids), vec!["c"]);
    assert!(!executor.executed("b"));

    let record = coordinator.registry().record(&AgentId::from("gen1")).unwrap();
    assert!(record.performance_history.contains(&0.0));
}

/// Test: No agents
/// Given a workflow and an empty registry
/// When it executes
/// Then the root task is blocked for lack of an agent, its dependent
/// is blocked on it, and the run fails without dispatching
#[tokio::test]
async fn test_no_agents_blocks_every_task() {
    let executor = Arc::new(RecordingExecutor::new());
    let coordinator = started_coordinator(Arc::clone(&executor));

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a", "b"]).blocking("b", "a"))
        .unwrap();

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(ids(&state.blocked_task_ids), vec!["a", "b"]);
    assert!(executor.records().is_empty());

    let tasks = coordinator.get_task_states(&wf).unwrap();
    assert_eq!(
        task(&tasks, "a").status,
        TaskStatus::Blocked {
            reason: BlockReason::NoAgentAvailable
        }
    );
    assert_eq!(
        task(&tasks, "b").status,
        TaskStatus::Blocked {
            reason: BlockReason::DependencyFailed {
                dependency: TaskId::from("a")
            }
        }
    );

    let history: Vec<_> = state.status_history().iter().map(|h| h.status).collect();
    assert_eq!(
        history,
        vec![WorkflowStatus::Initializing, WorkflowStatus::Failed]
    );
}

/// Test: Agent recovery during the retry sweep
/// Given the only agent offline when the workflow starts
/// When the pool manager reports it healthy shortly after
/// Then the blocked task is retried and the workflow completes
#[tokio::test]
async fn test_retry_sweep_picks_up_recovered_agent() {
    let executor = Arc::new(RecordingExecutor::new());
    let mut config = test_config();
    config.coordinator.retry_backoff_ms = 20;
    config.coordinator.max_retry_passes = 10;
    let coordinator = Arc::new(started_coordinator_with(config, Arc::clone(&executor)));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let agent = AgentId::from("gen1");
    coordinator
        .report_agent_health(&agent, AgentHealth::Offline, 0)
        .unwrap();
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a"]))
        .unwrap();

    let recovering = Arc::clone(&coordinator);
    let recovery = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        recovering
            .report_agent_health(&AgentId::from("gen1"), AgentHealth::Healthy, 0)
            .unwrap();
    });

    let state = coordinator
        .execute_workflow(&WorkflowId::from("wf"), ExecutionContext::new())
        .await
        .unwrap();
    recovery.await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(executor.record("a").agent_id, agent);
}

/// Test: Cancellation at a barrier
/// Given a running workflow whose first group is in flight
/// When it is cancelled
/// Then the in-flight task completes, the next group never starts,
/// and the workflow ends cancelled
#[tokio::test]
async fn test_cancel_stops_at_next_barrier() {
    let executor = Arc::new(RecordingExecutor::new().with_delay("a", 100));
    let coordinator = Arc::new(started_coordinator(Arc::clone(&executor)));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a", "b"]).blocking("b", "a"))
        .unwrap();

    let runner = Arc::clone(&coordinator);
    let run_id = wf.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_workflow(&run_id, ExecutionContext::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(coordinator.cancel_workflow(&wf).unwrap());

    let state = handle.await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(ids(&state.completed_task_ids), vec!["a"]);
    assert!(!executor.executed("b"));

    assert!(!coordinator.cancel_workflow(&wf).unwrap());
}

/// Test: Concurrent execution of one workflow
/// Given a workflow that is running
/// When it is executed, cleared or unregistered again
/// Then each call is rejected as already running
#[tokio::test]
async fn test_running_workflow_rejects_second_execution() {
    let executor = Arc::new(RecordingExecutor::new().with_delay("a", 80));
    let coordinator = Arc::new(started_coordinator(executor));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a"]))
        .unwrap();

    let runner = Arc::clone(&coordinator);
    let run_id = wf.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_workflow(&run_id, ExecutionContext::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        coordinator
            .execute_workflow(&wf, ExecutionContext::new())
            .await,
        Err(Error::WorkflowAlreadyRunning(_))
    ));
    assert!(matches!(
        coordinator.clear_workflow(&wf),
        Err(Error::WorkflowAlreadyRunning(_))
    ));
    assert!(matches!(
        coordinator.unregister_workflow(&wf),
        Err(Error::WorkflowAlreadyRunning(_))
    ));
    assert_eq!(
        coordinator.get_coordination_statistics().unwrap().active_workflows,
        1
    );

    let state = handle.await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
}

/// Test: Stopping mid-run
/// Given a running workflow
/// When the coordinator stops
/// Then the run ends cancelled and later operations fail fast
#[tokio::test]
async fn test_stop_cancels_running_workflow() {
    let executor = Arc::new(RecordingExecutor::new().with_delay("a", 60));
    let coordinator = Arc::new(started_coordinator(executor));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a", "b"]).blocking("b", "a"))
        .unwrap();

    let runner = Arc::clone(&coordinator);
    let run_id = wf.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_workflow(&run_id, ExecutionContext::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    coordinator.stop().await.unwrap();

    let state = handle.await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert!(matches!(
        coordinator.get_workflow_state(&wf),
        Err(Error::CoordinatorNotRunning)
    ));
}

/// Test: Lifecycle guard
/// Given a coordinator that was never started, then one that was stopped
/// When operations are invoked
/// Then they fail with CoordinatorNotRunning
#[tokio::test]
async fn test_operations_require_running_coordinator() {
    let coordinator = WorkflowCoordinator::new(test_config(), Arc::new(RecordingExecutor::new()));
    let wf = WorkflowId::from("wf");

    let not_running = |result: conductor::Result<()>| {
        assert!(matches!(result, Err(Error::CoordinatorNotRunning)));
    };
    not_running(coordinator.register_agent(
        AgentId::from("a"),
        AgentCapabilities::new(Specialization::General, 0.5),
    ));
    not_running(coordinator.register_workflow(WorkflowDefinition::new("wf", ["a"])));
    not_running(coordinator.get_workflow_state(&wf).map(|_| ()));
    not_running(coordinator.get_coordination_statistics().map(|_| ()));
    not_running(
        coordinator
            .execute_workflow(&wf, ExecutionContext::new())
            .await
            .map(|_| ()),
    );

    coordinator.start().unwrap();
    coordinator.start().unwrap();
    assert!(coordinator.is_running());
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a"]))
        .unwrap();

    coordinator.stop().await.unwrap();
    coordinator.stop().await.unwrap();
    assert!(!coordinator.is_running());
    not_running(coordinator.get_workflow_state(&wf).map(|_| ()));
}

/// Test: Starting without a runtime
/// Given no Tokio runtime on the current thread
/// When the coordinator is started
/// Then start fails instead of panicking
#[test]
fn test_start_outside_runtime_fails() {
    let coordinator = WorkflowCoordinator::new(test_config(), Arc::new(RecordingExecutor::new()));
    assert!(coordinator.start().is_err());
    assert!(!coordinator.is_running());
}

/// Test: Cycle detection
/// Given a dependency set containing a cycle
/// When the workflow registers
/// Then registration fails with the cycle and the workflow is unknown
#[tokio::test]
async fn test_cyclic_workflow_is_rejected() {
    let coordinator = started_coordinator(Arc::new(RecordingExecutor::new()));
    let err = coordinator
        .register_workflow(
            WorkflowDefinition::new("loop", ["a", "b", "c"])
                .blocking("b", "a")
                .blocking("c", "b")
                .soft("a", "c"),
        )
        .unwrap_err();

    match err {
        Error::CyclicDependency { cycle } => {
            assert!(cycle.len() >= 3);
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected cycle error, got {}", other),
    }
    assert!(matches!(
        coordinator.get_workflow_state(&WorkflowId::from("loop")),
        Err(Error::WorkflowNotFound(_))
    ));
}

/// Test: Invalid definitions
/// Given definitions with unknown references or no tasks
/// When they register
/// Then registration fails with a validation error
#[tokio::test]
async fn test_invalid_definitions_are_rejected() {
    let coordinator = started_coordinator(Arc::new(RecordingExecutor::new()));

    let unknown = coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a"]).blocking("a", "ghost"))
        .unwrap_err();
    assert!(unknown.is_validation());

    let empty = coordinator
        .register_workflow(WorkflowDefinition::new("wf", Vec::<TaskId>::new()))
        .unwrap_err();
    assert!(empty.is_validation());

    assert!(matches!(
        coordinator
            .execute_workflow(&WorkflowId::from("wf"), ExecutionContext::new())
            .await,
        Err(Error::WorkflowNotFound(_))
    ));
}

/// Test: Duration estimate bounds
/// Given one workflow estimated far beyond the accepted maximum and one at it
/// When both are registered and the accepted one executes
/// Then the oversized estimate is rejected and the other runs to completion
#[tokio::test]
async fn test_duration_estimate_bounds() {
    let coordinator = started_coordinator(Arc::new(RecordingExecutor::new()));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let oversized = coordinator
        .register_workflow(
            WorkflowDefinition::new("huge", ["a"]).with_estimated_duration(200_000_000_000_000),
        )
        .unwrap_err();
    assert!(oversized.is_validation());
    assert!(matches!(
        coordinator.get_workflow_state(&WorkflowId::from("huge")),
        Err(Error::WorkflowNotFound(_))
    ));

    let wf = WorkflowId::from("long");
    coordinator
        .register_workflow(
            WorkflowDefinition::new("long", ["a"])
                .with_estimated_duration(MAX_ESTIMATED_DURATION_MINUTES),
        )
        .unwrap();
    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
}

/// Test: Duplicate registration
/// Given a registered workflow
/// When the same id registers again
/// Then the second call is rejected and the first definition is kept
#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let coordinator = started_coordinator(Arc::new(RecordingExecutor::new()));
    let wf = WorkflowId::from("wf");

    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a", "b"]))
        .unwrap();
    let err = coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["x"]))
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowExists(_)));

    let kept = coordinator.get_workflow_definition(&wf).unwrap();
    assert_eq!(ids(&kept.task_ids), vec!["a", "b"]);
}

/// Test: Blocking quality gate
/// Given all tasks completing with qualities [0.5, 0.6] and a 0.8 gate
/// When the workflow executes
/// Then the gate fails and so does the workflow
#[tokio::test]
async fn test_failing_blocking_gate_fails_workflow() {
    let executor = Arc::new(
        RecordingExecutor::new()
            .with_quality("a", 0.5)
            .with_quality("b", 0.6),
    );
    let coordinator = started_coordinator(executor);
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a", "b"]))
        .unwrap();
    coordinator
        .register_quality_gate(QualityGate::new("quality", "wf", ["a", "b"], 0.8))
        .unwrap();
    coordinator
        .register_quality_gate(QualityGate::new("lenient", "wf", ["a"], 0.4).advisory())
        .unwrap();

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(ids(&state.completed_task_ids), vec!["a", "b"]);
    assert_eq!(
        coordinator.get_quality_gate("quality").unwrap().status,
        GateStatus::Failed
    );
    assert_eq!(
        coordinator.get_quality_gate("lenient").unwrap().status,
        GateStatus::Passed
    );

    let stats = coordinator.get_coordination_statistics().unwrap();
    assert_eq!(stats.quality_gates_failed, 1);
    assert_eq!(stats.quality_gates_passed, 1);
}

/// Test: Passing gate and advisory failure
/// Given qualities [0.9, 0.7, 0.95] with a blocking 0.8 gate and a
/// failing advisory gate
/// When the workflow executes
/// Then it completes
#[tokio::test]
async fn test_passing_gate_completes_despite_advisory_failure() {
    let executor = Arc::new(
        RecordingExecutor::new()
            .with_quality("a", 0.9)
            .with_quality("b", 0.7)
            .with_quality("c", 0.95),
    );
    let coordinator = started_coordinator(executor);
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    let wf = WorkflowId::from("wf");
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a", "b", "c"]))
        .unwrap();
    coordinator
        .register_quality_gate(QualityGate::new("mean", "wf", ["a", "b", "c"], 0.8))
        .unwrap();
    coordinator
        .register_quality_gate(QualityGate::new("strict", "wf", ["b"], 0.99).advisory())
        .unwrap();

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!(coordinator.validate_quality_gate("mean").unwrap());
    assert!(!coordinator.validate_quality_gate("strict").unwrap());
}

/// Test: Gate registration checks
/// Given gates for an unknown workflow or with unknown tasks
/// When they register
/// Then registration is rejected
#[tokio::test]
async fn test_gate_registration_is_validated() {
    let coordinator = started_coordinator(Arc::new(RecordingExecutor::new()));
    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a"]))
        .unwrap();

    assert!(matches!(
        coordinator.register_quality_gate(QualityGate::new("g", "other", ["a"], 0.5)),
        Err(Error::WorkflowNotFound(_))
    ));
    assert!(coordinator
        .register_quality_gate(QualityGate::new("g", "wf", ["ghost"], 0.5))
        .unwrap_err()
        .is_validation());
    assert!(coordinator
        .register_quality_gate(QualityGate::new("g", "wf", ["a"], 1.5))
        .unwrap_err()
        .is_validation());
    assert!(matches!(
        coordinator.get_quality_gate("g"),
        Err(Error::GateNotFound(_))
    ));
}
