mod report;
mod source;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gauntlet_core::config::AppConfig;
use gauntlet_core::event::EventBus;
use gauntlet_core::traits::ProviderGateway;
use gauntlet_core::types::{ExecutionId, InitialPayload, RunStatus};
use gauntlet_engine::{Orchestrator, RunLogger, WorkflowGraph, WorkflowMemory};
use gauntlet_llm::{HttpGateway, ScriptedGateway};

#[derive(Parser)]
#[command(name = "gauntlet", version, about = "Multi-provider code review pipeline")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gauntlet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over changed files or directories
    Run {
        /// Files or directories to review
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Write the final context as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Start node (defaults to pipeline.start)
        #[arg(long)]
        start: Option<String>,
        /// Overall deadline in seconds (0 disables; defaults to pipeline.deadline_secs)
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Run the pipeline offline against canned provider replies
    Demo {
        /// Write the final context as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the pipeline graph
    Graph {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gauntlet=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "gauntlet", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            paths,
            output,
            start,
            deadline_secs,
        } => {
            config.validate()?;
            let files = source::collect_files(&paths)?;
            if files.is_empty() {
                anyhow::bail!("no recognised code files found");
            }
            info!(files = files.len(), "Collected changed files");
            let gateway: Arc<dyn ProviderGateway> =
                Arc::new(HttpGateway::from_config(&config.providers)?);
            let run = RunRequest {
                start: start.unwrap_or_else(|| config.pipeline.start.clone()),
                deadline_secs: deadline_secs.unwrap_or(config.pipeline.deadline_secs),
                payload: InitialPayload::new(files),
                output,
            };
            execute(&config, gateway, run).await?;
        }
        Commands::Demo { output } => {
            // Scripted replies stand in for every provider, configured or not.
            WorkflowGraph::from_config(&config)?;
            let run = RunRequest {
                start: config.pipeline.start.clone(),
                deadline_secs: config.pipeline.deadline_secs,
                payload: InitialPayload::new(source::sample_files())
                    .with_metadata("mode", serde_json::json!("demo")),
                output,
            };
            execute(&config, Arc::new(ScriptedGateway::demo()), run).await?;
        }
        Commands::Graph { json } => {
            let graph = WorkflowGraph::from_config(&config)?;
            if json {
                println!("{}", graph.to_json()?);
            } else {
                print!("{}", graph.visualize());
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Load the config file, falling back to the built-in review pipeline.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".gauntlet").join("config.toml"));
    if let Some(home_config) = home_config.filter(|p| p.exists()) {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    eprintln!("Warning: No config file found, using the built-in review pipeline.");
    eprintln!("See gauntlet.toml.example for reference.");
    Ok(AppConfig::builtin())
}

struct RunRequest {
    start: String,
    deadline_secs: u64,
    payload: InitialPayload,
    output: Option<PathBuf>,
}

async fn execute(
    config: &AppConfig,
    gateway: Arc<dyn ProviderGateway>,
    run: RunRequest,
) -> anyhow::Result<()> {
    let memory = Arc::new(WorkflowMemory::new(config.memory.capacity));
    let event_bus = Arc::new(EventBus::default());
    let orchestrator = Orchestrator::from_config(config, gateway, memory)?
        .events(event_bus.clone())
        .build();

    let execution_id = ExecutionId::new();
    let cancel = CancellationToken::new();

    let logger = config.log.as_ref().filter(|l| l.enabled).map(|log| {
        RunLogger::new(log.resolved_dir(), log.level).spawn(
            event_bus.clone(),
            execution_id.clone(),
            cancel.clone(),
        )
    });

    // Live progress on stderr
    let mut rx = event_bus.subscribe();
    let progress_cancel = cancel.clone();
    let progress = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = progress_cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let Some(line) = report::progress_line(&event) {
                            eprintln!("{line}");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let deadline = (run.deadline_secs > 0).then(|| Duration::from_secs(run.deadline_secs));
    let outcome = orchestrator
        .run_as(execution_id, &run.start, run.payload, deadline)
        .await;

    // The logger stops by itself on run_finished; give it a moment to drain.
    if let Some(handle) = logger {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Run logger did not finish in time");
        }
    }
    cancel.cancel();
    progress.await.ok();

    let stats = orchestrator.stats();
    print!("{}", report::render_summary(&outcome, &stats));

    if let Some(path) = &run.output {
        report::write_json(&outcome, path)?;
        info!(path = %path.display(), "Report written");
    }

    match outcome.status() {
        RunStatus::Succeeded => Ok(()),
        status => anyhow::bail!("pipeline {status}"),
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
