// crates/chaincli/src/main.rs

use anyhow::{Context, Result};
use chaincore::{ExecutionEvent, NodeEvent, Value};
use chainruntime::{load_workflow_file, FlowRuntime, RuntimeConfig, ScriptWorkflow};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chain")]
#[command(about = "Continuation workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List the standard capabilities
    Capabilities,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            verbose,
        } => {
            init_tracing(verbose);
            let success = run_workflow(file, input, config, verbose).await?;
            return Ok(if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            });
        }

        Commands::Validate { file } => {
            init_tracing(false);
            validate_workflow(file).await?;
        }

        Commands::Capabilities => {
            list_capabilities();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_workflow(
    file: PathBuf,
    input: Option<String>,
    config: Option<PathBuf>,
    verbose: bool,
) -> Result<bool> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow_file(&file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    let name = workflow.name.clone();

    println!("📋 Workflow: {}", name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!();

    let input: Value = match input {
        Some(text) => serde_json::from_str(&text).context("Input must be valid JSON")?,
        None => json!({}),
    };
    tracing::debug!("Workflow input: {}", input);

    let mut config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config.log_activations |= verbose;

    let runtime = FlowRuntime::with_config(config);
    runtime
        .create_workflow(name.clone(), workflow.into_definition(chaincaps::standard()))
        .await?;

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { .. } => {
                    println!("▶️  Workflow started");
                }
                ExecutionEvent::NodeStarted { node, sandboxed, .. } => {
                    let kind = if sandboxed { "sandboxed" } else { "native" };
                    println!("  ⚡ Starting node: {} ({})", node, kind);
                }
                ExecutionEvent::NodeCompleted {
                    node,
                    calls,
                    duration_ms,
                    ..
                } => {
                    let targets: Vec<&str> = calls.iter().map(|c| c.target.as_str()).collect();
                    println!("  ✅ Node {} completed in {}ms -> {:?}", node, duration_ms, targets);
                }
                ExecutionEvent::NodeFailed { node, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node, error);
                }
                ExecutionEvent::NodeEvent { node, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node, message);
                    }
                    NodeEvent::Data { .. } => {}
                },
                ExecutionEvent::WorkflowCompleted {
                    success,
                    duration_ms,
                    ..
                } => {
                    if success {
                        println!("✨ Workflow completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Workflow failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let result = runtime.execute(&name, input).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();
    runtime.cleanup().await;

    println!();
    println!("📊 Result:");
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(result.success)
}

async fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow_file(&file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    let name = workflow.name.clone();

    let runtime = FlowRuntime::new();
    let graph = runtime
        .create_workflow(name.clone(), workflow.into_definition(chaincaps::standard()))
        .await?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", name);
    println!("   Nodes: {}", graph.nodes().len());
    for (node, trigger) in graph.triggers() {
        println!("   • {} ({})", node, serde_json::to_string(trigger)?);
    }

    Ok(())
}

fn list_capabilities() {
    println!("📦 Standard Capabilities:");
    println!();

    for (path, description) in chaincaps::list() {
        println!("  • {}", path);
        println!("    {}", description);
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let workflow = ScriptWorkflow::from_json(
        &json!({
            "name": "threshold",
            "description": "Routes on whether input.a is above 10",
            "nodes": [
                {
                    "name": "start",
                    "trigger": { "type": "request", "path": "/threshold" },
                    "script": "log.info('checking', input.a)\nif input.a > 10 then next('then', input) else next('else', input) end",
                    "capabilities": ["log.info"]
                },
                {
                    "name": "then",
                    "script": "next(next.SUCCESS, { message = input.a .. '>10!' })"
                },
                {
                    "name": "else",
                    "script": "next(next.ERROR, { message = input.a .. '<=10 :(' })"
                }
            ]
        })
        .to_string(),
    )?;

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  chain run --file {} --input '{{\"a\": 15}}'", output.display());

    Ok(())
}
