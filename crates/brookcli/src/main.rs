use anyhow::{bail, Context, Result};
use brookcore::{ExecutionEvent, Inputs, NodeEvent, NodeSpec, Value, Workflow};
use brookruntime::{schedule, Runtime, RuntimeConfig, WorkflowFile};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "brook")]
#[command(about = "Brook workflow engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file once
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input batch as JSON: {"node_id": [ {..item..} ]}. Replaces the file's data.
        #[arg(short, long)]
        input: Option<String>,

        /// Chunk workers for nodes without their own concurrency
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },

    /// Start a long-lived instance and feed it batches from stdin, one JSON object per line
    Instance {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .try_init();
}

fn runtime(config: RuntimeConfig) -> Runtime {
    let runtime = Runtime::with_config(config);
    brooknodes::register_all(runtime.registry());
    runtime
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { file, input, workers } => run_workflow(file, input, workers).await,
        Commands::Validate { file } => validate_workflow(file).await,
        Commands::Nodes => {
            list_nodes();
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(output).await,
        Commands::Instance { file } => run_instance(file).await,
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>, workers: Option<usize>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let WorkflowFile { workflow, data } = WorkflowFile::load(&file)
        .await
        .with_context(|| format!("failed to load {}", file.display()))?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let inputs: Inputs = match input {
        Some(raw) => serde_json::from_str(&raw).context("input must be a JSON object of node id to item list")?,
        None => data,
    };

    let mut config = RuntimeConfig::from_env();
    if let Some(workers) = workers {
        config.default_workers = workers;
    }
    let runtime = runtime(config);

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::NodeStarted { node_id, node_type, .. } => {
                    println!("  ⚡ Starting node: {} ({})", node_id, node_type);
                }
                ExecutionEvent::NodeCompleted { node_id, count, duration_ms, .. } => {
                    println!("  ✅ Node {} produced {} item(s) in {}ms", node_id, count, duration_ms);
                }
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node_id, error);
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node_id, message),
                    NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node_id, message),
                    NodeEvent::Progress { percent, message } => match message {
                        Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                        None => println!("     📊 [{}] {}%", node_id, percent),
                    },
                },
                ExecutionEvent::ExecutionCompleted { .. } => {
                    println!("✨ Workflow completed");
                }
            }
        }
    });

    let result = runtime.execute(workflow, inputs).await;

    // Let the listener print what is already buffered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    let result = result?;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Completed: {}/{} nodes in {}ms", result.completed_nodes, result.total_nodes, result.duration_ms);
    if !result.unscheduled.is_empty() {
        println!("   Skipped (cycle): {}", result.unscheduled.join(", "));
    }

    let mut node_ids: Vec<&String> = result.outputs.keys().collect();
    node_ids.sort();
    println!();
    println!("📤 Outputs:");
    for node_id in node_ids {
        let items = &result.outputs[node_id];
        if items.is_empty() {
            continue;
        }
        println!("   Node {}:", node_id);
        for item in items {
            println!("     {}", serde_json::to_string(item)?);
        }
    }

    Ok(())
}

async fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let WorkflowFile { workflow, data } = WorkflowFile::load(&file)
        .await
        .with_context(|| format!("failed to load {}", file.display()))?;

    let runtime = runtime(RuntimeConfig::default());
    let unknown: Vec<&str> = workflow
        .nodes
        .iter()
        .filter(|node| !runtime.registry().contains(&node.node_type))
        .map(|node| node.node_type.as_str())
        .collect();
    if !unknown.is_empty() {
        bail!("unknown node type(s): {}", unknown.join(", "));
    }

    let plan = schedule(&workflow)?;
    if !plan.is_complete() {
        bail!("cycle detected; unschedulable nodes: {}", plan.unscheduled.join(", "));
    }

    let stray: Vec<&String> = data.keys().filter(|id| workflow.find_node(id).is_none()).collect();
    if !stray.is_empty() {
        println!("⚠️  Data for unknown node(s) will be ignored: {:?}", stray);
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!("   Order: {}", plan.order.join(" → "));

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let runtime = runtime(RuntimeConfig::default());
    let registry = runtime.registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

async fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("example", "Example branching workflow");

    let start = workflow.add_node(
        NodeSpec::new("start", "echo")
            .with_name("Label items")
            .with_config("label", "example"),
    );
    let check = workflow.add_node(
        NodeSpec::new("check", "logic.if")
            .with_name("Is urgent?")
            .with_config("field", "urgent"),
    );
    let urgent = workflow.add_node(
        NodeSpec::new("urgent", "debug.log")
            .with_name("Log urgent")
            .with_config("prefix", "URGENT"),
    );
    let normal = workflow.add_node(
        NodeSpec::new("normal", "debug.log")
            .with_name("Log normal")
            .with_config("prefix", "normal"),
    );

    workflow.connect_main(start.clone(), check.clone());
    workflow.connect(check.clone(), "true", urgent, "main");
    workflow.connect(check, "false", normal, "main");

    let data = HashMap::from([(
        start,
        vec![
            HashMap::from([
                ("task".to_string(), Value::from("pay invoice")),
                ("urgent".to_string(), Value::Bool(true)),
            ]),
            HashMap::from([
                ("task".to_string(), Value::from("water plants")),
                ("urgent".to_string(), Value::Bool(false)),
            ]),
        ],
    )]);

    WorkflowFile::new(workflow, data).save(&output).await?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  brook run --file {}", output.display());

    Ok(())
}

async fn run_instance(file: PathBuf) -> Result<()> {
    let runtime = runtime(RuntimeConfig::from_env());
    let instances = runtime.instances();
    let instance = instances
        .create_from_workflow_path(&file)
        .await
        .with_context(|| format!("failed to start instance from {}", file.display()))?;

    println!("🟢 Instance {} ({}) started", instance.id, instance.name);
    println!("   Send one JSON batch per line on stdin; EOF or Ctrl-C stops it.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Inputs>(&line) {
                    Ok(batch) => {
                        if let Err(e) = instances.enqueue(&instance.id, batch) {
                            eprintln!("⚠️  {}", e);
                        }
                    }
                    Err(e) => eprintln!("⚠️  invalid batch: {}", e),
                }
            }
        }
    }

    if !interrupted {
        // Drain what was queued before stopping.
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = wait_idle(&instance) => {}
        }
    }

    instances.stop(&instance.id)?;
    instance.wait_stopped().await;

    println!();
    println!("📜 Logs:");
    for line in instance.logs() {
        println!("   {}", line);
    }

    Ok(())
}

/// Resolves once every accepted batch has finished running.
async fn wait_idle(instance: &brookruntime::Instance) {
    while instance.pending_batches() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
