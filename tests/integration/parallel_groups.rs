//! Group barrier and bounded parallelism tests.
//!
//! These tests verify that level groups run concurrently up to the
//! workflow's bound and that no group starts before the previous one
//! has fully resolved.

use std::sync::Arc;
use std::time::Duration;

use conductor::agent::{AgentId, Specialization};
use conductor::core::task::{TaskId, TaskStatus};
use conductor::orchestration::ExecutionContext;
use conductor::workflow::{WorkflowDefinition, WorkflowId, WorkflowStatus};

use crate::fixtures::{
    add_agent, add_agent_with_capacity, ids, started_coordinator, RecordingExecutor,
};

/// Test: Group barrier
/// Given groups [{A, B}, {C}] where C depends on both A and B
/// When the workflow executes
/// Then C is dispatched only after A and B both completed
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_group_barrier_orders_dispatch_after_completion() {
    let executor = Arc::new(
        RecordingExecutor::new()
            .with_delay("A", 30)
            .with_delay("B", 60)
            .with_delay("C", 5),
    );
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);
    add_agent(&coordinator, "gen2", Specialization::General, 0.5);

    let wf = WorkflowId::from("barrier");
    coordinator
        .register_workflow(
            WorkflowDefinition::new("barrier", ["A", "B", "C"])
                .blocking("C", "A")
                .blocking("C", "B"),
        )
        .unwrap();

    let plan = coordinator.get_execution_plan(&wf).unwrap();
    assert_eq!(plan.groups.len(), 2);
    assert_eq!(ids(&plan.groups[0].task_ids), vec!["A", "B"]);
    assert_eq!(ids(&plan.groups[1].task_ids), vec!["C"]);

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);

    // Executor clock.
    let a = executor.record("A");
    let b = executor.record("B");
    let c = executor.record("C");
    assert!(a.started < b.finished, "A and B should overlap");
    assert!(c.started >= a.finished.max(b.finished));

    // Recorded task timestamps.
    let tasks = coordinator.get_task_states(&wf).unwrap();
    let find = |id: &str| tasks.iter().find(|t| t.task_id.as_str() == id).unwrap();
    let c_dispatched = find("C").started_at.unwrap();
    let a_completed = find("A").completed_at.unwrap();
    let b_completed = find("B").completed_at.unwrap();
    assert!(c_dispatched >= a_completed.max(b_completed));
}

/// Test: Bounded parallelism
/// Given 6 independent tasks and max_parallel_tasks = 2
/// When the workflow executes
/// Then at most 2 tasks run at any moment
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallelism_is_bounded_by_definition() {
    let executor = Arc::new(RecordingExecutor::new().with_default_delay(20));
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent_with_capacity(&coordinator, "gen1", Specialization::General, 0.5, 6);

    coordinator
        .register_workflow(
            WorkflowDefinition::new("bounded", ["t1", "t2", "t3", "t4", "t5", "t6"])
                .with_max_parallel_tasks(2),
        )
        .unwrap();

    let state = coordinator
        .execute_workflow(&WorkflowId::from("bounded"), ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(executor.records().len(), 6);
    assert_eq!(executor.peak_concurrency(), 2);
}

/// Test: Default bound
/// Given a definition that leaves max_parallel_tasks at 0
/// When 6 independent tasks execute
/// Then the configured default of 4 applies
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_default_parallelism_bound() {
    let executor = Arc::new(RecordingExecutor::new().with_default_delay(30));
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent_with_capacity(&coordinator, "gen1", Specialization::General, 0.5, 10);

    coordinator
        .register_workflow(WorkflowDefinition::new(
            "wide",
            ["t1", "t2", "t3", "t4", "t5", "t6"],
        ))
        .unwrap();
    coordinator
        .execute_workflow(&WorkflowId::from("wide"), ExecutionContext::new())
        .await
        .unwrap();

    assert!(executor.peak_concurrency() <= 4);
    assert!(executor.peak_concurrency() >= 2);
}

/// Test: Sequential execution
/// Given a definition with parallel execution disabled
/// When independent tasks execute
/// Then they run one at a time in definition order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_workflow_runs_one_at_a_time() {
    let executor = Arc::new(RecordingExecutor::new().with_default_delay(10));
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent_with_capacity(&coordinator, "gen1", Specialization::General, 0.5, 4);

    coordinator
        .register_workflow(WorkflowDefinition::new("seq", ["a", "b", "c"]).sequential())
        .unwrap();
    coordinator
        .execute_workflow(&WorkflowId::from("seq"), ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(executor.peak_concurrency(), 1);
    let order: Vec<String> = executor
        .records()
        .iter()
        .map(|r| r.task_id.to_string())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    let stats = coordinator.get_coordination_statistics().unwrap();
    assert_eq!(stats.parallel_tasks_executed, 0);
}

/// Test: Load of queued tasks
/// Given three tasks routed to one agent and a group bound of 1
/// When the first task is running and the others wait for a slot
/// Then the agent reports one active task and two reservations
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_tasks_are_reserved_not_active() {
    let executor = Arc::new(RecordingExecutor::new().with_default_delay(150));
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent_with_capacity(&coordinator, "gen1", Specialization::General, 0.5, 4);

    coordinator
        .register_workflow(WorkflowDefinition::new("queued", ["a", "b", "c"]).sequential())
        .unwrap();

    let gen1 = AgentId::from("gen1");
    let queued_id = WorkflowId::from("queued");
    let (state, snapshot) = tokio::join!(
        coordinator.execute_workflow(&queued_id, ExecutionContext::new()),
        async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            coordinator.registry().snapshot(&gen1).unwrap()
        }
    );

    assert_eq!(snapshot.active_tasks, 1);
    assert_eq!(snapshot.reserved_tasks, 2);
    assert_eq!(state.unwrap().status, WorkflowStatus::Completed);

    let after = coordinator.registry().snapshot(&gen1).unwrap();
    assert_eq!((after.active_tasks, after.reserved_tasks), (0, 0));
}

/// Test: Diamond leveling
/// Given A -> {B, C} -> D
/// When the workflow registers and executes
/// Then levels are 0/1/1/2, B and C form the only parallel group,
/// and D starts after both B and C finished
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diamond_levels_and_execution() {
    let executor = Arc::new(
        RecordingExecutor::new()
            .with_delay("B", 20)
            .with_delay("C", 40),
    );
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);
    add_agent(&coordinator, "gen2", Specialization::General, 0.5);

    let wf = WorkflowId::from("diamond");
    coordinator
        .register_workflow(
            WorkflowDefinition::new("diamond", ["A", "B", "C", "D"])
                .blocking("B", "A")
                .blocking("C", "A")
                .blocking("D", "B")
                .blocking("D", "C"),
        )
        .unwrap();

    for (task, level) in [("A", 0), ("B", 1), ("C", 1), ("D", 2)] {
        assert_eq!(
            coordinator.task_level(&wf, &TaskId::from(task)).unwrap(),
            level,
            "level of {}",
            task
        );
    }

    let plan = coordinator.get_execution_plan(&wf).unwrap();
    let parallel: Vec<Vec<&str>> = plan
        .parallel_groups()
        .map(|g| ids(&g.task_ids))
        .collect();
    assert_eq!(parallel, vec![vec!["B", "C"]]);

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);

    let d = executor.record("D");
    assert!(d.started >= executor.record("B").finished);
    assert!(d.started >= executor.record("C").finished);
    assert!(executor.record("B").started < executor.record("C").finished);

    let stats = coordinator.get_coordination_statistics().unwrap();
    assert_eq!(stats.tasks_dispatched, 4);
    assert_eq!(stats.parallel_tasks_executed, 2);
}

/// Test: Capacity-limited agent
/// Given one agent that takes a single task at a time
/// When three independent tasks are ready together
/// Then the surplus is blocked and picked up by retry sweeps until all complete
#[tokio::test]
async fn test_capacity_limited_agent_drains_group_through_retries() {
    let executor = Arc::new(RecordingExecutor::new().with_default_delay(5));
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent_with_capacity(&coordinator, "solo", Specialization::General, 0.8, 1);

    let wf = WorkflowId::from("narrow");
    coordinator
        .register_workflow(WorkflowDefinition::new("narrow", ["a", "b", "c"]))
        .unwrap();

    let state = coordinator
        .execute_workflow(&wf, ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(executor.peak_concurrency(), 1);
    let tasks = coordinator.get_task_states(&wf).unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(tasks.iter().all(|t| t.attempts == 1));
}
