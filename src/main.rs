use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conflux_core::config::AppConfig;
use conflux_core::event::EventBus;
use conflux_core::graph::Graph;
use conflux_core::state::{HumanInput, RunOutcome};
use conflux_core::types::ExecutionId;
use conflux_engine::{ExecutionPlan, RunLogger, WorkflowEngine};
use conflux_llm::ProviderRegistry;
use conflux_store::SqliteExecutionStore;
use conflux_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "conflux", version, about = "Workflow engine for agent graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conflux.toml", env = "CONFLUX_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new execution of a workflow graph
    Run {
        /// Graph definition (JSON)
        graph: PathBuf,
        /// Initial user input
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
        /// Project (tenant) the execution belongs to
        #[arg(long)]
        project: Option<String>,
    },
    /// Answer a paused execution and continue it
    Resume {
        execution_id: String,
        /// The human input
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
        /// Input token issued with a deployment-mode pause
        #[arg(long)]
        token: Option<String>,
    },
    /// Continue an execution from its persisted state
    Continue { execution_id: String },
    /// Stop an execution
    Stop { execution_id: String },
    /// Show an execution, or list recent ones when no id is given
    Status {
        execution_id: Option<String>,
        /// Number of executions to list
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print the execution order of a graph without running it
    Plan {
        /// Graph definition (JSON)
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conflux=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Planning needs neither config nor store
    if let Commands::Plan { graph } = &cli.command {
        let graph = load_graph(graph)?;
        print_plan(&graph);
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    let db_path = config.store.resolved_path();
    let store = Arc::new(
        SqliteExecutionStore::open(&db_path)
            .with_context(|| format!("opening execution store at {}", db_path.display()))?,
    );

    if let Commands::Status {
        execution_id: None,
        limit,
    } = &cli.command
    {
        for (id, status) in store.list_recent(*limit)? {
            println!("{id}  {status}");
        }
        return Ok(());
    }

    let events = Arc::new(EventBus::default());
    let engine = WorkflowEngine::new(
        store,
        Arc::new(ProviderRegistry::new(config.providers.clone())),
        Arc::new(ToolRegistry::from_config(&config.tools)?),
        events.clone(),
        config.engine.clone(),
    );

    // Subscribe before the run starts so no event is missed
    let cancel = CancellationToken::new();
    let logger_task = match &config.log {
        Some(log_config) if log_config.enabled => {
            let logger = RunLogger::new(log_config.resolved_dir(), log_config.level);
            let rx = events.subscribe();
            let log_cancel = cancel.clone();
            info!(level = log_config.level, "RunLogger started");
            Some(tokio::spawn(logger.run(rx, log_cancel)))
        }
        _ => None,
    };

    let result = dispatch(&engine, cli.command).await;

    cancel.cancel();
    if let Some(task) = logger_task {
        task.await.ok();
    }
    result
}

async fn dispatch(engine: &WorkflowEngine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            graph,
            input,
            project,
        } => {
            let graph = load_graph(&graph)?;
            let input = input.join(" ");
            let outcome = match project {
                Some(project) => engine.start_with_project(graph, &input, &project).await?,
                None => engine.start(graph, &input).await?,
            };
            print_outcome(&outcome)
        }
        Commands::Resume {
            execution_id,
            text,
            token,
        } => {
            let mut input = HumanInput::new(text.join(" "));
            if let Some(token) = token {
                input = input.with_token(token);
            }
            let outcome = engine
                .resume(&ExecutionId::from_str(&execution_id), input)
                .await?;
            print_outcome(&outcome)
        }
        Commands::Continue { execution_id } => {
            let outcome = engine
                .continue_run(&ExecutionId::from_str(&execution_id))
                .await?;
            print_outcome(&outcome)
        }
        Commands::Stop { execution_id } => {
            let status = engine.stop(&ExecutionId::from_str(&execution_id)).await?;
            println!("{execution_id}  {status}");
            Ok(())
        }
        Commands::Status {
            execution_id: Some(execution_id),
            ..
        } => {
            let state = engine.status(&ExecutionId::from_str(&execution_id)).await?;
            println!("Execution: {}", state.id);
            println!("Status:    {}", state.status);
            if let Some(project) = &state.project {
                println!("Project:   {project}");
            }
            println!(
                "Executed:  {}",
                state.executed_nodes.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            println!("Messages:  {}", state.messages.len());
            if let Some(error) = &state.error {
                println!("Error:     {error}");
            }
            if let Some(ctx) = &state.human_input_context {
                println!("Waiting on '{}': {}", ctx.node_name, ctx.prompt_title);
            }
            Ok(())
        }
        Commands::Status { .. } | Commands::Plan { .. } => Ok(()),
    }
}

fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph {}", path.display()))?;
    Ok(Graph::from_json(&json)?)
}

fn print_plan(graph: &Graph) {
    let plan = ExecutionPlan::parse(graph);
    for (i, id) in plan.order().iter().enumerate() {
        let deps = plan.dependencies(id);
        if deps.is_empty() {
            println!("{:>3}. {id}", i + 1);
        } else {
            println!("{:>3}. {id}  <- {}", i + 1, deps.join(", "));
        }
    }
    if !plan.repaired().is_empty() {
        println!("Appended after cycle repair: {}", plan.repaired().join(", "));
    }
}

fn print_outcome(outcome: &RunOutcome) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::Completed(state) => {
            for message in state.messages.iter().filter(|m| !m.is_workflow_marker()) {
                println!("[{}] {}: {}", message.sequence, message.agent_name, message.content);
            }
            println!("\n{}  COMPLETED", state.id);
        }
        RunOutcome::Suspended(descriptor) => {
            println!("{}", serde_json::to_string_pretty(descriptor)?);
        }
        RunOutcome::Failed {
            execution_id,
            error,
        } => {
            println!("{execution_id}  FAILED: {error}");
        }
        RunOutcome::Stopped { execution_id } => {
            println!("{execution_id}  STOPPED");
        }
    }
    Ok(())
}
