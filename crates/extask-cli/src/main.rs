//! extask CLI - operator interface for the external-task leasing engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use extask_core::TaskId;
use extask_core::app::{EngineBuilder, EngineConfig, StoreKind};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;

/// extask - durable external task leasing
#[derive(Parser)]
#[command(name = "extask")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (store and lease defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the config file)
    #[arg(long, env = "EXTASK_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a pending task
    Create {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        correlation_id: String,
        #[arg(long)]
        process_model_id: String,
        #[arg(long)]
        process_instance_id: String,
        #[arg(long)]
        flow_node_instance_id: String,
        /// Opaque payload handed to the worker
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Opaque caller identity blob
        #[arg(long, default_value = "")]
        caller_context: String,
    },
    /// Fetch and lock available tasks on a topic
    Fetch {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        topic: String,
        /// Maximum number of tasks (0 or less = all available)
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        max_tasks: i64,
        /// Lease length in milliseconds (defaults to the configured lease)
        #[arg(long)]
        lock_ms: Option<i64>,
    },
    /// Replace a held lease with one ending `lock_ms` from now
    Extend {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        task: TaskId,
        #[arg(long, allow_negative_numbers = true)]
        lock_ms: i64,
    },
    /// Finish a task successfully
    Complete {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        task: TaskId,
        #[arg(long, default_value = "{}")]
        result: String,
    },
    /// Finish a task with an opaque error blob
    Fail {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        task: TaskId,
        #[arg(long)]
        error: String,
    },
    /// Finish a task with a BPMN error code
    BpmnError {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        task: TaskId,
        #[arg(long)]
        code: String,
    },
    /// Finish a task with a service failure
    ServiceError {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        task: TaskId,
        #[arg(long)]
        message: String,
        #[arg(long, default_value = "")]
        details: String,
    },
    /// Show one task by id
    Show { task: TaskId },
    /// Find a task by its instance triple
    Find {
        #[arg(long)]
        correlation_id: String,
        #[arg(long)]
        process_instance_id: String,
        #[arg(long)]
        flow_node_instance_id: String,
    },
    /// Delete every task of a process model, ignoring leases
    Purge {
        #[arg(long)]
        process_model_id: String,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.store.kind = StoreKind::Sqlite;
        config.store.path = database.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = load_config(&cli)?;
    let engine = EngineBuilder::from_config(&config)
        .context("Failed to open task store")?
        .build()
        .context("Failed to build engine")?;
    engine
        .initialize()
        .await
        .context("Failed to initialize task store")?;

    let outcome = commands::run(&engine, cli.command).await;
    engine
        .dispose()
        .await
        .context("Failed to close task store")?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn database_flag_forces_sqlite_store() {
        let cli = Cli::try_parse_from([
            "extask",
            "--database",
            "/tmp/tasks.db",
            "fetch",
            "--worker",
            "w1",
            "--topic",
            "t1",
            "--max-tasks",
            "-1",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.store.kind, StoreKind::Sqlite);
        assert_eq!(config.store.path, PathBuf::from("/tmp/tasks.db"));
        assert!(matches!(
            cli.command,
            Commands::Fetch { max_tasks: -1, lock_ms: None, .. }
        ));
    }

    #[test]
    fn task_ids_parse_with_prefix() {
        let id: TaskId = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
        let cli = Cli::try_parse_from(["extask", "show", "task-01ARZ3NDEKTSV4RRFFQ69G5FAV"]).unwrap();

        assert!(matches!(cli.command, Commands::Show { task } if task == id));
    }
}
