use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shoal_storage::Database;
use shoal_sync::{build_scheduler, engine_from_env, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shoal")]
#[command(about = "Incremental scraper for paginated content-record feeds")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan every tracked entity for new feed entries.
    Sync,
    /// Walk the social graph and register newly discovered owners.
    Discover,
    /// Apply database migrations.
    Migrate,
    /// Run discovery + sync on the configured cron schedule until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = engine_from_env(&config).await?;
            let summary = engine.run_once().await?;
            println!(
                "sync complete: run_id={} scanned={} skipped={} new_records={} failed={}",
                summary.run_id, summary.scanned, summary.skipped, summary.new_records, summary.failed
            );
        }
        Commands::Discover => {
            let engine = engine_from_env(&config).await?;
            let summary = engine.discover_once().await?;
            println!(
                "discovery complete: run_id={} scanned={} discovered={} failed={}",
                summary.run_id, summary.scanned, summary.discovered, summary.failed
            );
        }
        Commands::Migrate => {
            let db = Database::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            db.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Run => {
            let engine = Arc::new(engine_from_env(&config).await?);
            let scheduler = build_scheduler(engine, &config).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(
                crons = %format!("{} | {}", config.sync_cron_1, config.sync_cron_2),
                "scheduler running, press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
