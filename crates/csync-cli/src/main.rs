use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use csync_sync::{write_reports, SupplierRegistry, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "csync")]
#[command(about = "Supplier catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled supplier once.
    Sync {
        /// Limit the run to these supplier codes or ids.
        #[arg(long = "supplier")]
        suppliers: Vec<String>,
        /// Also write the run reports to this JSON file.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Keep running and sync on the configured cron schedule.
    Schedule,
    /// Validate and list the supplier registry.
    Suppliers,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("csync=info,csync_sync=info,csync_adapters=info,csync_storage=info"));
    let json = std::env::var("CSYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

fn cancel_on_ctrl_c(pipeline: &SyncPipeline) {
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current page");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        suppliers: Vec::new(),
        report: None,
    }) {
        Commands::Sync { suppliers, report } => {
            let pipeline = SyncPipeline::from_env().await?;
            cancel_on_ctrl_c(&pipeline);
            let reports = pipeline.run_once(&suppliers).await?;
            for r in &reports {
                println!("{}", serde_json::to_string(r)?);
            }
            if let Some(path) = report {
                write_reports(&path, &reports).await?;
                info!(path = %path.display(), "reports written");
            }
            let failed = reports.iter().filter(|r| !r.is_success()).count();
            if failed > 0 {
                bail!("{failed} of {} supplier runs failed", reports.len());
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            csync_sync::migrate(&config.database_url).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let store = csync_sync::open_store(&config.database_url, config.db_max_connections).await?;
            let pipeline = Arc::new(SyncPipeline::new(
                config,
                store,
                Arc::new(csync_sync::EnvCredentialProvider::default()),
            )?);
            pipeline.load_registry().await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await?;
            info!(cron = %pipeline.config().sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await?;
            pipeline.cancellation_token().cancel();
            sched.shutdown().await?;
        }
        Commands::Suppliers => {
            let config = SyncConfig::from_env();
            let registry = SupplierRegistry::load(&config.suppliers_file).await?;
            for s in &registry.suppliers {
                println!(
                    "{}\t{}\t{}\t{}",
                    s.supplier_id,
                    s.code,
                    s.protocol,
                    if s.enabled { "enabled" } else { "disabled" }
                );
            }
        }
    }

    Ok(())
}
