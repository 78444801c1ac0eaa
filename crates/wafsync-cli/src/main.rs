use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wafsync_sync::{
    cleanup_artifacts, dump_catalog, restore_catalog, CancelSignal, RunSummary, Stage,
    SyncConfig, SyncPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "wafsync")]
#[command(about = "Change-tracking sync of WAF ISO metadata")]
struct Cli {
    /// YAML configuration file; defaults to $WAFSYNC_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl, fetch and enrich.
    Run,
    Crawl,
    Fetch,
    Enrich,
    /// Export the catalog to a compressed snapshot.
    Dump,
    /// Replace the catalog with a snapshot.
    Restore { path: PathBuf },
    /// Prune old run reports and snapshots.
    Cleanup,
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} {:?}: stages={} failures={} active={} deleted={} reports={}",
        summary.run_id,
        summary.status,
        summary.stages.join(","),
        summary.failure_count(),
        summary.catalog.active,
        summary.catalog.deleted,
        summary.reports_dir
    );
}

async fn run_stages(config: SyncConfig, stages: &[Stage]) -> Result<()> {
    let pipeline = SyncPipeline::open(config).await?;
    let cancel = CancelSignal::new();
    let interrupt = cancel.cancel_on_ctrl_c();
    let result = pipeline.run_stages(stages, cancel).await;
    interrupt.abort();
    print_summary(&result?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_stages(config, &Stage::ALL).await?,
        Commands::Crawl => run_stages(config, &[Stage::Crawl]).await?,
        Commands::Fetch => run_stages(config, &[Stage::Fetch]).await?,
        Commands::Enrich => run_stages(config, &[Stage::Enrich]).await?,
        Commands::Dump => {
            let path = dump_catalog(&config).await?;
            println!("catalog exported to {}", path.display());
        }
        Commands::Restore { path } => {
            let restored = restore_catalog(&config, &path).await?;
            println!("catalog restored: {restored} entries from {}", path.display());
        }
        Commands::Cleanup => {
            let report = cleanup_artifacts(&config, SystemTime::now())?;
            println!(
                "cleanup: {} report dirs and {} snapshots deleted, {} failed",
                report.reports.deleted.len(),
                report.snapshots.deleted.len(),
                report.reports.failed.len() + report.snapshots.failed.len()
            );
        }
    }

    Ok(())
}
