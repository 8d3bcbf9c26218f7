//! Workflow coordination engine for specialized agents.
//!
//! A `WorkflowCoordinator` validates workflow definitions, groups tasks by
//! dependency level, routes each task to the best available agent and
//! dispatches groups concurrently behind a barrier, tracking progress and
//! quality gates along the way.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod manifest;
pub mod orchestration;
pub mod util;
pub mod workflow;

pub use error::{Error, Result};
pub use orchestration::{TaskExecutor, WorkflowCoordinator};
