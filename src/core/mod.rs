//! Core domain models for workflow coordination.
//!
//! This module contains the task runtime model and the dependency graph
//! used to validate workflows and plan their parallel execution.

pub mod dag;
pub mod task;

pub use dag::{DependencyGraph, ExecutionPlan, TaskGroup};
pub use task::{BlockReason, DependencyKind, TaskDependency, TaskId, TaskRuntimeState, TaskStatus};
