//! Refload - reference register import tool

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use refload_common::checksum::sha256_file;
use refload_common::logging::{init_logging, LogConfig, LogLevel};
use refload_ingest::{
    CancelFlag, ImportOrchestrator, ImportStatus, IngestConfig, LoadStrategy, MemoryStore, PgStore,
    RegisterKind, TableStore,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "refload")]
#[command(author, version, about = "Reference register import tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one or more registers now
    Run {
        /// Registers to import
        #[arg(value_enum, required_unless_present = "all")]
        registers: Vec<RegisterKind>,

        /// Import every register
        #[arg(long, conflicts_with = "registers")]
        all: bool,

        /// Run the whole pipeline against an in-memory store
        #[arg(long)]
        dry_run: bool,

        /// Print the reports as JSON
        #[arg(long)]
        json: bool,

        /// Override REFLOAD_LOAD_STRATEGY (in_place, shadow_swap)
        #[arg(long)]
        strategy: Option<LoadStrategy>,

        /// Override REFLOAD_WORK_DIR
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Create or update the register tables
    Migrate,

    /// Print the SHA-256 fingerprint of a downloaded snapshot
    Hash {
        /// Snapshot file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("refload")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            registers,
            all,
            dry_run,
            json,
            strategy,
            work_dir,
        } => {
            let mut config = IngestConfig::from_env()?;
            if let Some(strategy) = strategy {
                config.load_strategy = strategy;
            }
            if let Some(work_dir) = work_dir {
                config.work_dir = work_dir;
            }
            let registers = if all {
                RegisterKind::ALL.to_vec()
            } else {
                registers
            };
            run(config, registers, dry_run, json).await
        },
        Command::Migrate => {
            let config = IngestConfig::from_env()?;
            let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
            store.migrate().await?;
            Ok(())
        },
        Command::Hash { file } => {
            println!("{}  {}", sha256_file(&file)?, file.display());
            Ok(())
        },
    }
}

async fn run(config: IngestConfig, registers: Vec<RegisterKind>, dry_run: bool, json: bool) -> Result<()> {
    let store: Arc<dyn TableStore> = if dry_run {
        info!("Dry run: loading into an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::connect(&config.database_url, config.database_max_connections).await?)
    };
    let orchestrator = ImportOrchestrator::new(config, store).await?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling imports");
                cancel.cancel();
            }
        });
    }

    let reports = futures::future::join_all(
        registers
            .iter()
            .map(|register| orchestrator.run_import_with_cancel(*register, &cancel)),
    )
    .await;

    for report in &reports {
        if json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            println!(
                "{:<8} {:<10} loaded={} dropped={} skipped={}{}",
                report.register,
                format!("{:?}", report.status).to_lowercase(),
                report.records_loaded,
                report.records_dropped,
                report.records_skipped,
                report
                    .error
                    .as_deref()
                    .map(|e| format!(" error=\"{}\"", e))
                    .unwrap_or_default()
            );
        }
    }

    let failed = reports
        .iter()
        .filter(|r| r.status == ImportStatus::Failed)
        .count();
    if failed > 0 {
        bail!("{} of {} imports failed", failed, reports.len());
    }
    Ok(())
}
