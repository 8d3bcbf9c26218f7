//! Workflow definitions and runtime state.
//!
//! A `WorkflowDefinition` is the immutable, declarative input; a
//! `WorkflowRuntimeState` tracks one execution of it.

mod state;
mod types;

pub use state::{StatusHistoryEntry, WorkflowRuntimeState};
pub use types::{WorkflowDefinition, WorkflowId, WorkflowStatus, MAX_ESTIMATED_DURATION_MINUTES};
