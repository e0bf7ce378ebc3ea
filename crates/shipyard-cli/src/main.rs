use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shipyard_bus::{tracing_middleware, Bus};
use shipyard_core::config::ShipyardConfig;
use shipyard_core::error::Result as CoreResult;
use shipyard_core::types::Paginated;
use shipyard_scheduler::{DismissJob, GetJobs, Job, JobStore, RetryJob, Scheduler, WorkerPool};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "shipyard", version, about = "Durable background jobs on SQLite")]
struct Cli {
    /// Configuration file (defaults to $SHIPYARD_CONFIG, then ~/.shipyard/shipyard.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker pool until Ctrl-C.
    Serve,
    /// Inspect and administer queued jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    /// List queued jobs, oldest first.
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Print the raw page as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Clear the error of a failed job so it runs again now.
    Retry { id: String },
    /// Delete a cancellable job that is not running.
    Dismiss { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose {
        "shipyard=debug,shipyard_scheduler=debug,shipyard_bus=debug"
    } else {
        "shipyard=info,shipyard_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();

    // explicit flag > SHIPYARD_CONFIG env > ~/.shipyard/shipyard.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("SHIPYARD_CONFIG").ok());
    let config = ShipyardConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        ShipyardConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path)
        .with_context(|| format!("cannot create the directory of {db_path}"))?;
    info!(path = %db_path, "opening job store");
    let store = JobStore::open(db_path)?;

    let bus = Arc::new(Bus::with_middlewares(vec![tracing_middleware()]));
    Scheduler::new(store.clone(), Arc::clone(&bus)).register_handlers();

    match cli.command {
        Command::Serve => serve(store, bus, &config).await,
        Command::Jobs(command) => {
            store.migrate()?;
            jobs(&bus, command).await
        }
    }
}

async fn serve(store: JobStore, bus: Arc<Bus>, config: &ShipyardConfig) -> anyhow::Result<()> {
    store.setup()?;
    let pool = WorkerPool::new(
        store,
        bus,
        config.runners.poll_interval(),
        config.runners.effective_groups(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = tokio::spawn(pool.run(shutdown_rx));
    info!("shipyard running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, waiting for running jobs");
    let _ = shutdown_tx.send(true);
    pool.await?;
    Ok(())
}

async fn jobs(bus: &Bus, command: JobsCommand) -> anyhow::Result<()> {
    match command {
        JobsCommand::List { page, json } => {
            let jobs = bus.send(GetJobs { page: Some(page) }).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
        }
        JobsCommand::Retry { id } => {
            bus.send(RetryJob { id: id.clone() }).await?;
            println!("job {id} will be retried");
        }
        JobsCommand::Dismiss { id } => {
            bus.send(DismissJob { id: id.clone() }).await?;
            println!("job {id} dismissed");
        }
    }
    Ok(())
}

fn print_jobs(page: &Paginated<Job>) {
    if page.data.is_empty() {
        println!("no jobs (page {})", page.page);
        return;
    }

    println!(
        "{:<36}  {:<8}  {:<32}  {:<20}  {:<19}  ERROR",
        "ID", "STATE", "MESSAGE", "RESOURCE", "NOT BEFORE"
    );
    for job in &page.data {
        println!(
            "{:<36}  {:<8}  {:<32}  {:<20}  {:<19}  {}",
            job.id.as_str(),
            state(job),
            job.message_name,
            job.resource_id,
            job.not_before.format("%Y-%m-%d %H:%M:%S"),
            job.error_code.as_deref().unwrap_or("-"),
        );
    }

    let more = if page.is_last_page {
        String::new()
    } else {
        format!(", next: --page {}", page.page + 1)
    };
    println!("page {} · {} job(s) total{more}", page.page, page.total);
}

fn state(job: &Job) -> &'static str {
    if job.retrieved {
        "running"
    } else if job.error_code.is_some() {
        "failed"
    } else if job.not_before > chrono::Utc::now() {
        "waiting"
    } else {
        "pending"
    }
}

fn ensure_parent_dir(path: &str) -> CoreResult<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
