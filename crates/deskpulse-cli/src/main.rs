use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use deskpulse_core::{AggregationGrain, EntityKind};
use deskpulse_storage::PgStore;
use deskpulse_sync::{Scheduler, SyncConfig, SyncEngine};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "deskpulse")]
#[command(about = "Helpdesk incremental sync and analytics rollups")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync for an entity (tickets, organizations, agents, groups) or `all`.
    Sync {
        #[arg(default_value = "all")]
        entity: String,
    },
    /// Aggregate the period containing DATE (defaults to the last closed period).
    Aggregate {
        grain: AggregationGrain,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Daily aggregation for every day in FROM..=TO.
    Backfill { from: NaiveDate, to: NaiveDate },
    /// Print checkpoints and recent aggregation runs as JSON.
    Status {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    Migrate,
    /// Start the scheduler and run until interrupted.
    Run,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
        }
        Commands::Sync { entity } => {
            let entities = if entity.eq_ignore_ascii_case("all") {
                EntityKind::ALL.to_vec()
            } else {
                vec![entity.parse::<EntityKind>()?]
            };
            let engine = SyncEngine::with_store(&config, connect(&config).await?)?;
            for entity in entities {
                let summary = engine.sync(entity).await?;
                println!(
                    "sync complete: entity={} run_id={} pages={} upserted={} failed={} cursor={}",
                    summary.entity,
                    summary.run_id,
                    summary.pages,
                    summary.upserted,
                    summary.failed,
                    summary.cursor
                );
            }
        }
        Commands::Aggregate { grain, date } => {
            let date = date.unwrap_or_else(|| grain.previous_period(Utc::now().date_naive()));
            let engine = SyncEngine::with_store(&config, connect(&config).await?)?;
            let outcome = engine.aggregate(grain, date).await?;
            println!(
                "aggregation complete: grain={} period={} tickets={} rows={}",
                outcome.grain,
                outcome.period_start,
                outcome.tickets_considered,
                outcome.rows_written
            );
        }
        Commands::Backfill { from, to } => {
            let engine = SyncEngine::with_store(&config, connect(&config).await?)?;
            let summary = engine.backfill(from, to).await?;
            println!(
                "backfill complete: days={} succeeded={} failed={} rows={}",
                summary.days, summary.succeeded, summary.failed, summary.rows_written
            );
        }
        Commands::Status { limit } => {
            let engine = SyncEngine::with_store(&config, connect(&config).await?)?;
            let report = engine.status(limit).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing status report")?
            );
        }
        Commands::Run => {
            let tasks = config.schedule()?;
            let engine = Arc::new(SyncEngine::with_store(&config, connect(&config).await?)?);
            let scheduler = Scheduler::new(
                engine,
                tasks,
                Duration::from_secs(config.startup_jitter_secs),
            );
            let mut sched = scheduler.start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutdown requested");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
