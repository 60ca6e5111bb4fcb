//! # Steward — persistent state & scheduling core
//!
//! Usage:
//!   steward serve                                  # Run the scheduler until Ctrl-C
//!   steward status                                 # Storage readiness + task counts
//!   steward task add --name digest --cron "0 8 * * *" --prompt "Summarize my emails"
//!   steward task list
//!   steward task run <id>                          # Execute now, print the response

mod executor;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

use steward_core::StewardConfig;
use steward_scheduler::{NewTask, Scheduler, Task, TaskManager, TaskStore, TaskUpdate};
use steward_store::Database;

use crate::executor::HttpPromptExecutor;

#[derive(Parser)]
#[command(
    name = "steward",
    version,
    about = "⏰ Steward — persistent state & cron scheduling for a personal assistant"
)]
struct Cli {
    /// Config file (default: ~/.steward/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path, overrides [storage] path (":memory:" allowed)
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and run until interrupted
    Serve,
    /// Check storage and print task counts
    Status,
    /// Manage scheduled tasks
    #[command(subcommand)]
    Task(TaskCommand),
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task
    Add {
        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        /// 5-field cron expression, UTC
        #[arg(long)]
        cron: String,
        #[arg(long)]
        prompt: String,
        /// Delivery config as JSON, e.g. '{"type":"slack","channel":"#digest"}'
        #[arg(long)]
        delivery: Option<String>,
    },
    /// List all tasks
    List,
    /// Show one task as JSON
    Show { id: String },
    /// Change fields of a task
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, conflicts_with = "clear_delivery")]
        delivery: Option<String>,
        /// Remove the delivery config
        #[arg(long)]
        clear_delivery: bool,
    },
    Enable { id: String },
    Disable { id: String },
    /// Delete a task and its run history
    Remove { id: String },
    /// Show recent runs of a task
    Runs {
        id: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Execute a task now and print the response
    Run { id: String },
    /// List enabled tasks whose next run has passed
    Due,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let mut config = match &cli.config {
        Some(path) => StewardConfig::load_from(path)?,
        None => StewardConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.storage.path = db;
    }

    let db_path = config.storage.resolved_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("opening storage at {}", db_path.display()))?;
    let store = TaskStore::new(db.clone());
    let executor = Arc::new(HttpPromptExecutor::from_config(&config.executor)?);
    let scheduler = Scheduler::new(store.clone(), executor, config.scheduler.clone());

    match cli.command {
        Command::Serve => serve(&config, scheduler).await,
        Command::Status => status(&db, &store),
        Command::Task(cmd) => {
            let manager = TaskManager::new(store.clone(), Arc::new(scheduler));
            task_command(cmd, &manager, &store).await
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "steward=debug" } else { "steward=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn serve(config: &StewardConfig, scheduler: Scheduler) -> Result<()> {
    if !config.scheduler.enabled {
        tracing::warn!("⚠️ Scheduler disabled in config; nothing to serve");
        return Ok(());
    }
    tracing::info!("🚀 Steward starting (endpoint: {})", config.executor.endpoint);
    scheduler.start().await?;

    // Picks up edits made by `steward task ...` in another process.
    let every = Duration::from_secs(config.scheduler.reconcile_interval_secs.max(1));
    let mut reconcile = tokio::time::interval(every);
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
    reconcile.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                break;
            }
            _ = reconcile.tick() => {
                // Retried next tick; armed timers keep running meanwhile.
                if let Err(e) = scheduler.reconcile() {
                    tracing::warn!("⚠️ Reconcile failed: {e}");
                }
            }
        }
    }

    tracing::info!("🛑 Shutdown requested");
    scheduler.stop();
    Ok(())
}

fn status(db: &Database, store: &TaskStore) -> Result<()> {
    db.ping().context("storage ping failed")?;
    let (total, enabled) = store.counts()?;
    println!("✅ Storage ready: {}", db.path().display());
    println!("   Schema:   v{}", db.schema_version()?);
    println!("   Tasks:    {total} ({enabled} enabled)");
    println!("   Due now:  {}", store.get_due_tasks(Utc::now())?.len());
    Ok(())
}

async fn task_command(cmd: TaskCommand, manager: &TaskManager, store: &TaskStore) -> Result<()> {
    match cmd {
        TaskCommand::Add { id, name, cron, prompt, delivery } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut new = NewTask::new(&id, &name, &cron, &prompt);
            if let Some(raw) = delivery {
                new = new.with_delivery(parse_delivery(&raw)?);
            }
            let task = manager.create(new).await?;
            println!("📅 Created task {}", task.id);
            print_task(&task);
        }
        TaskCommand::List => {
            let tasks = manager.list()?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                print_task(task);
            }
        }
        TaskCommand::Show { id } => {
            let task = manager
                .get(&id)?
                .with_context(|| format!("task not found: {id}"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommand::Update { id, name, cron, prompt, delivery, clear_delivery } => {
            let delivery = match (delivery, clear_delivery) {
                (Some(raw), _) => Some(Some(parse_delivery(&raw)?)),
                (None, true) => Some(None),
                (None, false) => None,
            };
            let update = TaskUpdate {
                name,
                cron_expression: cron,
                prompt,
                delivery,
                enabled: None,
            };
            let task = manager.update(&id, update).await?;
            println!("✏️ Updated task {}", task.id);
            print_task(&task);
        }
        TaskCommand::Enable { id } => {
            let task = manager.enable(&id).await?;
            println!("▶️ Enabled task {}", task.id);
        }
        TaskCommand::Disable { id } => {
            let task = manager.disable(&id).await?;
            println!("⏸️ Disabled task {}", task.id);
        }
        TaskCommand::Remove { id } => {
            manager.delete(&id).await?;
            println!("🗑️ Removed task {id}");
        }
        TaskCommand::Runs { id, limit } => {
            for run in manager.runs(&id, limit)? {
                let result = run.result.as_deref().unwrap_or("");
                let preview: String = result.chars().take(80).collect();
                println!(
                    "{}  {:<7}  {}  {}",
                    run.started_at.to_rfc3339(),
                    run.status.as_str(),
                    run.id,
                    preview.replace('\n', " ")
                );
            }
        }
        TaskCommand::Run { id } => {
            let text = manager.run_now(&id).await?;
            println!("{text}");
        }
        TaskCommand::Due => {
            for task in store.get_due_tasks(Utc::now())? {
                print_task(&task);
            }
        }
    }
    Ok(())
}

fn parse_delivery(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid delivery JSON: {raw}"))
}

fn print_task(task: &Task) {
    let state = if task.enabled { "on " } else { "off" };
    let next = task
        .next_run_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".into());
    println!(
        "[{state}] {:<36}  {:<15}  next: {next}  {}",
        task.id, task.cron_expression, task.name
    );
}
