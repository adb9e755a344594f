//! schedworker CLI: run a scheduling worker or feed the shared backlog.

use clap::{Parser, Subcommand};
use poolsched::backlog::Backlog;
use poolsched::config::{Config, WorkerConfig};
use poolsched::db::Db;
use poolsched::engine::Worker;
use poolsched::handler::HandlerRegistry;
use poolsched::model::{IntentionId, NewIntention, UserId};
use poolsched::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "schedworker", about = "Fair-share intention scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker against the shared backlog
    Run {
        /// Worker config (priority list, batching, handlers)
        #[arg(long, default_value = "schedworker.toml")]
        config: PathBuf,
        /// Exit at the first pass that finds no ready work
        #[arg(long)]
        finish: bool,
    },
    /// Submit a new intention
    Submit {
        /// Intention kind tag
        kind: String,
        /// Owning user (UUID)
        #[arg(long)]
        user: uuid::Uuid,
        /// Prerequisite intention (UUID), repeatable
        #[arg(long)]
        after: Vec<uuid::Uuid>,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
    },
    /// Show pending and archived counts per kind
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, finish } => cmd_run(config, finish).await,
        Command::Submit {
            kind,
            user,
            after,
            params,
        } => {
            let db = connect().await?;
            cmd_submit(&db, kind, user, after, params).await
        }
        Command::Status => {
            let db = connect().await?;
            cmd_status(&db).await
        }
    }
}

async fn connect() -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_run(path: PathBuf, finish: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let worker_config = WorkerConfig::load(&path)?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "schedworker".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let registry = HandlerRegistry::from_config(&worker_config.handlers)?;
    let mut worker = Worker::from_registry(
        Arc::new(db),
        &registry,
        &worker_config.priority,
        worker_config.loop_config(finish)?,
    )?;

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, stopping after the current job");
        shutdown.shutdown();
    });

    let stats = worker.run().await?;
    println!(
        "{} job(s): {} succeeded, {} failed, {} incomplete",
        stats.jobs, stats.succeeded, stats.failed, stats.incomplete
    );
    Ok(())
}

async fn cmd_submit(
    db: &Db,
    kind: String,
    user: uuid::Uuid,
    after: Vec<uuid::Uuid>,
    params: Option<String>,
) -> anyhow::Result<()> {
    let params: serde_json::Value = match params {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewIntention::new(UserId(user), kind.as_str()).params(params);
    for prereq in after {
        new = new.after(IntentionId(prereq));
    }

    let id = db.submit(new).await?;
    println!("Submitted: {}", id.0);
    Ok(())
}

async fn cmd_status(db: &Db) -> anyhow::Result<()> {
    let counts = db.counts().await?;
    if counts.is_empty() {
        println!("Backlog is empty.");
        return Ok(());
    }

    println!(
        "{:<24}  {:>8}  {:>8}  {:>9}  {:>6}",
        "KIND", "PENDING", "CLAIMED", "SUCCEEDED", "FAILED"
    );
    println!("{}", "-".repeat(63));
    for (kind, c) in &counts {
        println!(
            "{:<24}  {:>8}  {:>8}  {:>9}  {:>6}",
            kind.as_str(),
            c.pending,
            c.claimed,
            c.succeeded,
            c.failed
        );
    }
    Ok(())
}
