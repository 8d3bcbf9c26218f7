use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use conductor::config::Config;
use conductor::core::dag::{DependencyGraph, ExecutionPlan};
use conductor::core::task::{TaskId, TaskRuntimeState};
use conductor::manifest::Manifest;
use conductor::orchestration::{
    CoordinationStatistics, ExecutionContext, QualityGate, WorkflowCoordinator,
};
use conductor::workflow::{WorkflowId, WorkflowRuntimeState};
use conductor::{Error, Result};

/// Conductor - dependency-aware multi-agent workflow coordinator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONDUCTOR_LOG=<filter> Full tracing filter directive, e.g. conductor=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Coordinator config file (defaults to ~/.conductor/conductor.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a workflow manifest against its simulated agent pool
    Run {
        /// Path to the TOML workflow manifest
        manifest: PathBuf,

        /// Execution context entry, repeatable (key=value, value parsed as JSON when possible)
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// Also write the JSON report to this file
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Check a manifest and print its execution plan
    Validate {
        /// Path to the TOML workflow manifest
        manifest: PathBuf,
    },
}

/// Everything known about a finished run.
#[derive(Debug, Serialize)]
struct RunReport {
    workflow: WorkflowRuntimeState,
    tasks: Vec<TaskRuntimeState>,
    gates: Vec<QualityGate>,
    statistics: CoordinationStatistics,
}

#[derive(Debug, Serialize)]
struct PlanReport {
    workflow_id: WorkflowId,
    task_count: usize,
    dependency_count: usize,
    plan: ExecutionPlan,
    parallel_groups: usize,
    order: Vec<TaskId>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            manifest,
            context,
            output,
        } => run(config, &manifest, &context, output.as_deref()),
        Command::Validate { manifest } => validate(&manifest),
    }
}

/// Parse `key=value` pairs; values that are not valid JSON stay strings.
fn parse_context(entries: &[String]) -> Result<ExecutionContext> {
    let mut context = ExecutionContext::new();
    for entry in entries {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            Error::Validation(format!("context entry must be key=value: {}", entry))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Validation(format!(
                "context entry has an empty key: {}",
                entry
            )));
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        context.insert(key.to_string(), value);
    }
    Ok(context)
}

fn run(config: Config, manifest_path: &Path, context: &[String], output: Option<&Path>) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let context = parse_context(context)?;

    let rt = tokio::runtime::Runtime::new()?;

    let report = rt.block_on(async {
        let coordinator =
            WorkflowCoordinator::new(config, Arc::new(manifest.simulated_executor()));
        coordinator.start()?;

        let result = execute(&coordinator, &manifest, context).await;
        coordinator.stop().await?;
        result
    })?;

    let json = serde_json::to_string_pretty(&report)?;
    if let Some(path) = output {
        fs::write(path, &json)?;
        tracing::info!(path = %path.display(), "run report written");
    }
    println!("{}", json);

    Ok(())
}

async fn execute(
    coordinator: &WorkflowCoordinator,
    manifest: &Manifest,
    context: ExecutionContext,
) -> Result<RunReport> {
    let workflow_id = manifest.install(coordinator)?;
    let workflow = coordinator.execute_workflow(&workflow_id, context).await?;

    let gates = manifest
        .gates
        .iter()
        .map(|gate| coordinator.get_quality_gate(&gate.gate_id))
        .collect::<Result<Vec<_>>>()?;

    Ok(RunReport {
        workflow,
        tasks: coordinator.get_task_states(&workflow_id)?,
        gates,
        statistics: coordinator.get_coordination_statistics()?,
    })
}

fn validate(manifest_path: &Path) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let graph = DependencyGraph::build(&manifest.workflow)?;
    graph.ensure_acyclic()?;

    let plan = graph.without_soft_dependencies().execution_plan()?;
    let report = PlanReport {
        workflow_id: manifest.workflow.workflow_id.clone(),
        task_count: graph.task_count(),
        dependency_count: graph.dependency_count(),
        parallel_groups: plan.parallel_groups().count(),
        order: plan.ordered_task_ids(),
        plan,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
