use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowkeeper_core::impls::{HandlerRegistry, TaskHandler, TracingNotifier};
use flowkeeper_core::{ExecutorConfig, TaskExecutionKey, TaskExecutorCore, TaskScheduleCommand};

#[derive(Parser, Debug)]
#[command(name = "flowkeeper")]
#[command(version)]
#[command(about = "Task-execution scheduler: start, stop and restart task attempts")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the executor, reading commands and heartbeats from stdin (one JSON object per line)
    Run {
        /// Path to the executor config (YAML)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Validate a config file and print the effective configuration
    CheckConfig {
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
}

/// One line of stdin.
///
/// `{"command": {"action": "START", "current_task_execution": {...}}}` or
/// `{"heartbeat": {"workflow_execution_id": 1, "task_name": "t", "attempt": 1}}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Input {
    Command(TaskScheduleCommand),
    Heartbeat(TaskExecutionKey),
}

/// In-process tasks have no registered body when run from the CLI; they
/// complete as soon as they get a slot.
struct Noop;

#[async_trait]
impl TaskHandler for Noop {
    async fn run(&self, key: &TaskExecutionKey) -> Result<(), String> {
        info!(key = %key, "no in-process handler, completing");
        Ok(())
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ExecutorConfig> {
    match path {
        Some(path) => ExecutorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ExecutorConfig::default()),
    }
}

async fn run(config: ExecutorConfig) -> anyhow::Result<()> {
    let mut registry = HandlerRegistry::new();
    registry.set_fallback(Arc::new(Noop));

    let executor =
        TaskExecutorCore::from_config(config, Arc::new(registry), Arc::new(TracingNotifier))?;
    executor.start().await?;
    info!(backend = executor.backend_name(), "reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            info!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Input>(&line) {
            Ok(Input::Command(command)) => {
                if let Err(e) = executor.schedule_task(command).await {
                    warn!(error = %e, "command rejected");
                }
            }
            Ok(Input::Heartbeat(key)) => executor.record_heartbeat(&key),
            Err(e) => warn!(error = %e, "unreadable input line"),
        }
    }

    executor.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowkeeper=info,flowkeeper_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run { config } => run(load_config(config.as_ref())?).await,
        Commands::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
