//! Flowdeck flow runner binary.
//!
//! Runs a flow definition file against the configured backend services.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flow_engine::schedule::resolve_order;
use flow_engine::{
    EngineConfig, Execution, ExecutionStatus, FlowDefinition, FlowEngine, Listener, StepStatus,
    SubmitRequest, TriggerKind,
};

#[derive(Parser)]
#[command(name = "flow-runner")]
#[command(version, about = "Flowdeck flow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow definition and print the final execution record
    Run {
        /// Flow definition file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Trigger kind: manual, scheduled, api, event
        #[arg(long, default_value = "manual")]
        trigger: TriggerKind,

        /// Actor recorded as the initiator of the run
        #[arg(long, default_value = "cli")]
        actor: String,

        /// Set variables (format: key=value), can be repeated
        #[arg(long = "var", value_name = "KEY=VALUE")]
        variables: Vec<String>,
    },
    /// Validate a flow definition and show its step order
    Validate {
        /// Flow definition file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flow_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            trigger,
            actor,
            variables,
        } => run_flow(&file, trigger, actor, &variables).await,
        Commands::Validate { file } => validate_flow(&file),
    }
}

async fn run_flow(file: &Path, trigger: TriggerKind, actor: String, variables: &[String]) -> Result<()> {
    let flow = FlowDefinition::from_file(file)
        .with_context(|| format!("Failed to load flow from {}", file.display()))?;

    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    tracing::info!(
        service_url = %config.service_url,
        request_timeout_secs = config.request_timeout_secs,
        default_step_timeout_ms = config.default_step_timeout_ms,
        "Engine configuration loaded"
    );

    let engine = FlowEngine::from_config(config);

    let mut request = SubmitRequest::new(actor).with_trigger(trigger);
    for (name, value) in parse_variables(variables)? {
        request = request.with_variable(name, value);
    }

    let prepared = engine.prepare(&flow, request)?;
    let execution_id = prepared.execution_id();
    engine.subscribe(execution_id, progress_listener())?;

    // Handle shutdown signals
    let canceller = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(execution_id = %execution_id, "Shutdown signal received, cancelling");
                if let Err(e) = engine.cancel(execution_id) {
                    tracing::warn!(error = %e, "Cancel failed");
                }
            }
        })
    };

    let execution = engine.run(prepared).await;
    canceller.abort();

    println!("{}", serde_json::to_string_pretty(&execution)?);

    if execution.status != ExecutionStatus::Completed {
        let reason = execution
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_else(|| execution.status.to_string());
        anyhow::bail!("Execution {} did not complete ({})", execution.id, reason);
    }

    Ok(())
}

fn validate_flow(file: &Path) -> Result<()> {
    let flow = FlowDefinition::from_file(file)
        .with_context(|| format!("Failed to load flow from {}", file.display()))?;
    let order = resolve_order(&flow)?;

    println!(
        "Flow '{}' ({}) version {} is valid",
        flow.name, flow.id, flow.version
    );
    for (position, &index) in order.iter().enumerate() {
        let step = &flow.steps[index];
        println!("  {}. {} [{}]", position + 1, step.id, step.kind);
    }
    Ok(())
}

/// Log a progress line for every execution update.
fn progress_listener() -> Listener {
    Arc::new(|execution: &Execution| {
        let current = execution
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Running)
            .map(|s| s.step_id.as_str())
            .unwrap_or("-");

        tracing::info!(
            execution_id = %execution.id,
            status = %execution.status,
            current_step = current,
            completed = execution.metrics.completed_steps,
            failed = execution.metrics.failed_steps,
            total = execution.metrics.total_steps,
            "Execution progress"
        );
    })
}

/// Parse key=value variables. Values that parse as JSON keep their type.
fn parse_variables(variables: &[String]) -> Result<HashMap<String, serde_json::Value>> {
    let mut vars = HashMap::new();
    for var in variables {
        let (name, raw) = var
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid variable format: {}. Expected key=value", var))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        vars.insert(name.to_string(), value);
    }
    Ok(vars)
}
