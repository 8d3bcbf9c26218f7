//! Orchestration layer of the coordination engine.
//!
//! This module provides the agent registry, score-based task routing,
//! quality gates, bounded group dispatch, coordination metrics and the
//! `WorkflowCoordinator` that drives them.

mod coordinator;
mod dispatch;
mod metrics;
mod quality;
mod registry;
mod router;

pub use coordinator::{CoordinationStatistics, CoordinatorEvent, WorkflowCoordinator};
pub use dispatch::{
    DispatchReport, DispatchResult, ExecutionContext, GroupReport, GroupRunner, TaskDispatch,
    TaskExecutor, TaskOutcome,
};
pub use metrics::{
    CollectorHandle, CoordinationMetrics, CoordinationMetricsCollector, ExecutionTimings,
};
pub use quality::{GateStatus, QualityGate, QualityGateEvaluator};
pub use registry::{
    AgentCapabilityRecord, AgentRegistry, AgentSnapshot, HealthReport, NEUTRAL_PERFORMANCE,
};
pub use router::{RouterStats, RoutingRequest, RoutingWeights, TaskRouter};
