use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use wis_sync::{GroupingStatus, RunStatus, RunSummary, SyncConfig, SyncService};

#[derive(Debug, Parser)]
#[command(name = "wis-cli")]
#[command(about = "Work item sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Incremental extraction for every enabled stream.
    Sync,
    /// Rebuild and reconcile grouping memberships.
    Memberships,
    Migrate,
    /// Run extraction on the configured cron until interrupted.
    Schedule,
    /// Print a stream's stored cursor.
    Cursor {
        #[arg(long)]
        org: String,
        #[arg(long)]
        source: String,
    },
    /// Compare stored payloads with a direct lookup.
    Verify {
        #[arg(long)]
        org: String,
        #[arg(long)]
        source: String,
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,
    },
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(true).init();
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after in-flight pages");
            token.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &RunSummary, report: &std::path::Path) {
    println!(
        "{:?} run complete: run_id={} streams={} completed={} partial={} skipped={} aborted={} groupings_failed={} groupings_throttled={} report={}",
        summary.kind,
        summary.run_id,
        summary.streams.len(),
        summary.stream_count(RunStatus::Completed),
        summary.stream_count(RunStatus::Partial),
        summary.stream_count(RunStatus::Skipped),
        summary.stream_count(RunStatus::Aborted),
        summary.grouping_count(GroupingStatus::Failed),
        summary.grouping_count(GroupingStatus::Throttled),
        report.display()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let service = SyncService::from_env().await?;
            let (summary, report) = service.run_once(&cancel_on_interrupt()).await?;
            print_summary(&summary, &report);
        }
        Commands::Memberships => {
            let service = SyncService::from_env().await?;
            let (summary, report) = service.refresh_memberships(&cancel_on_interrupt()).await?;
            print_summary(&summary, &report);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let pool = wis_storage::create_pool(&config.database_url)
                .await
                .context("connecting to postgres")?;
            wis_storage::run_migrations(&pool)
                .await
                .context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let cancel = CancellationToken::new();
            let service = Arc::new(SyncService::from_env().await?);
            let Some(mut sched) = wis_sync::maybe_build_scheduler(service, cancel.clone()).await?
            else {
                bail!("scheduler is disabled; set WIS_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Cursor { org, source } => {
            let service = SyncService::from_env().await?;
            match service.cursor(&org, &source).await? {
                Some(cursor) => println!("{}", serde_json::to_string_pretty(&cursor)?),
                None => println!("no cursor stored for {org}/{source}"),
            }
        }
        Commands::Verify { org, source, ids } => {
            let service = SyncService::from_env().await?;
            let report = service.verify(&org, &source, &ids).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
