use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hlt_storage::PgStore;
use hlt_sync::{maybe_build_scheduler, CycleConfig, CycleRunner};

#[derive(Debug, Parser)]
#[command(name = "hlt-cli")]
#[command(about = "Home Listing Tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single ingestion cycle.
    Run,
    /// Run cycles on the configured cron schedule until interrupted.
    Schedule,
    /// Apply the Postgres schema (no-op for the file-backed store).
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = hlt_sync::run_cycle_once_from_env().await?;
            println!(
                "cycle complete: run_id={} created={} changed={} expired={} unchanged={}",
                summary.run_id,
                summary.created.len(),
                summary.changed.len(),
                summary.expired.len(),
                summary.unchanged
            );
        }
        Commands::Schedule => {
            let runner = Arc::new(CycleRunner::from_config(CycleConfig::from_env()).await?);
            match maybe_build_scheduler(runner).await? {
                Some(mut sched) => {
                    sched.start().await?;
                    tracing::info!("scheduler running; press ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                    sched.shutdown().await?;
                }
                None => {
                    eprintln!("HLT_SCHEDULER_ENABLED is not set; nothing to schedule");
                }
            }
        }
        Commands::Migrate => {
            let config = CycleConfig::from_env();
            match config.database_url {
                Some(url) => {
                    PgStore::connect(&url).await?.migrate().await?;
                    println!("schema applied");
                }
                None => {
                    eprintln!("DATABASE_URL not set; the file-backed store needs no migration");
                }
            }
        }
    }

    Ok(())
}
