//! Agent routing tests.
//!
//! These tests verify deterministic agent selection, specialization
//! preference with fallback, health filtering and the performance
//! feedback that completed dispatches leave in the registry.

use std::sync::Arc;

use conductor::agent::{AgentCapabilities, AgentHealth, AgentId, Specialization};
use conductor::config::{RegistryConfig, RoutingConfig};
use conductor::core::task::TaskId;
use conductor::orchestration::{AgentRegistry, ExecutionContext, RoutingRequest, TaskRouter};
use conductor::workflow::{WorkflowDefinition, WorkflowId, WorkflowStatus};

use crate::fixtures::{add_agent, started_coordinator, RecordingExecutor};

fn populated_registry() -> AgentRegistry {
    let registry = AgentRegistry::new(RegistryConfig::default());
    for (id, spec, skill) in [
        ("doc1", Specialization::Documentation, 0.9),
        ("doc2", Specialization::Documentation, 0.6),
        ("sec1", Specialization::Security, 0.95),
        ("gen1", Specialization::General, 0.5),
    ] {
        registry
            .register(AgentId::from(id), AgentCapabilities::new(spec, skill))
            .unwrap();
    }
    registry
}

/// Test: Routing determinism
/// Given fixed candidates and no cache entry
/// When selection is repeated on fresh routers
/// Then the same agent is picked every time
#[test]
fn test_select_agent_is_deterministic() {
    let registry = populated_registry();
    let candidates = registry.list_available(None);
    let request = RoutingRequest::new(TaskId::from("write-docs"), Specialization::Documentation);

    let picks: Vec<AgentId> = (0..5)
        .map(|_| {
            TaskRouter::new(RoutingConfig::default())
                .select_agent(&request, &candidates)
                .unwrap()
        })
        .collect();

    assert!(picks.iter().all(|p| p == &picks[0]));
    assert_eq!(picks[0], AgentId::from("doc1"));
}

/// Test: Routing cache
/// Given a confident first decision
/// When the same request is routed again
/// Then the cached agent is returned and counted as a hit
#[test]
fn test_repeated_request_hits_cache() {
    let registry = populated_registry();
    let candidates = registry.list_available(None);
    let router = TaskRouter::new(RoutingConfig::default());
    let request = RoutingRequest::new(TaskId::from("audit"), Specialization::Security);

    let first = router.select_agent(&request, &candidates).unwrap();
    let second = router.select_agent(&request, &candidates).unwrap();
    assert_eq!(first, AgentId::from("sec1"));
    assert_eq!(first, second);

    let stats = router.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cached_entries, 1);

    router.clear_cache();
    assert_eq!(router.stats().cached_entries, 0);
}

/// Test: No candidates
/// Given an empty candidate list
/// When an agent is selected
/// Then nothing is returned
#[test]
fn test_no_candidates_selects_nothing() {
    let router = TaskRouter::new(RoutingConfig::default());
    let request = RoutingRequest::new(TaskId::from("t"), Specialization::General);
    assert!(router.select_agent(&request, &[]).is_none());
}

/// Test: Specialization preference
/// Given a weak documentation agent and a strong general agent
/// When a documentation task executes
/// Then it goes to the documentation agent
#[tokio::test]
async fn test_specialist_preferred_over_stronger_generalist() {
    let executor = Arc::new(RecordingExecutor::new());
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent(&coordinator, "gen1", Specialization::General, 1.0);
    add_agent(&coordinator, "doc1", Specialization::Documentation, 0.3);

    coordinator
        .register_workflow(
            WorkflowDefinition::new("wf", ["write"]).assign("write", Specialization::Documentation),
        )
        .unwrap();
    coordinator
        .execute_workflow(&WorkflowId::from("wf"), ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(executor.record("write").agent_id, AgentId::from("doc1"));
}

/// Test: Specialization fallback
/// Given no agent with the required specialization
/// When the task executes
/// Then any available agent takes it
#[tokio::test]
async fn test_falls_back_to_any_available_agent() {
    let executor = Arc::new(RecordingExecutor::new());
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    coordinator
        .register_workflow(
            WorkflowDefinition::new("wf", ["audit"]).assign("audit", Specialization::Security),
        )
        .unwrap();
    let state = coordinator
        .execute_workflow(&WorkflowId::from("wf"), ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(executor.record("audit").agent_id, AgentId::from("gen1"));
}

/// Test: Health filtering
/// Given the only specialist reported offline
/// When its task executes
/// Then the task falls back to a healthy agent
#[tokio::test]
async fn test_offline_agent_is_not_routed() {
    let executor = Arc::new(RecordingExecutor::new());
    let coordinator = started_coordinator(Arc::clone(&executor));
    add_agent(&coordinator, "doc1", Specialization::Documentation, 0.9);
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);
    coordinator
        .report_agent_health(&AgentId::from("doc1"), AgentHealth::Offline, 0)
        .unwrap();

    coordinator
        .register_workflow(
            WorkflowDefinition::new("wf", ["write"]).assign("write", Specialization::Documentation),
        )
        .unwrap();
    coordinator
        .execute_workflow(&WorkflowId::from("wf"), ExecutionContext::new())
        .await
        .unwrap();

    assert_eq!(executor.record("write").agent_id, AgentId::from("gen1"));
}

/// Test: Performance feedback
/// Given an agent with no history
/// When it completes tasks with known quality
/// Then its history holds the scores and its skill is nudged
#[tokio::test]
async fn test_completed_dispatch_updates_agent_record() {
    let executor = Arc::new(
        RecordingExecutor::new()
            .with_quality("a", 1.0)
            .with_quality("b", 0.8),
    );
    let coordinator = started_coordinator(executor);
    add_agent(&coordinator, "gen1", Specialization::General, 0.5);

    coordinator
        .register_workflow(WorkflowDefinition::new("wf", ["a", "b"]).blocking("b", "a"))
        .unwrap();
    coordinator
        .execute_workflow(&WorkflowId::from("wf"), ExecutionContext::new())
        .await
        .unwrap();

    let record = coordinator.registry().record(&AgentId::from("gen1")).unwrap();
    assert_eq!(record.performance_history, vec![1.0, 0.8]);
    assert_eq!(record.adaptation_score, 0.8);
    assert!((record.mean_performance() - 0.9).abs() < 1e-9);
    // 0.5 + 0.5 * 0.1 + 0.3 * 0.1
    assert!((record.skill_level - 0.58).abs() < 1e-9);

    let snapshot = coordinator.registry().snapshot(&AgentId::from("gen1")).unwrap();
    assert_eq!(snapshot.active_tasks, 0);
}
