//! pgguard: PostgreSQL backups and restores to local disk or S3, one-shot or
//! on a cron schedule.

// pgguard/src/main.rs
mod backup;
mod cli;
mod config;
mod errors;
mod restore;
mod scheduler;
mod setup_tracing;
mod storage;
mod utils;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cli::{BackupAction, Cli, Commands, RestoreAction, ScheduleAction, StorageAction};
use config::AppConfig;
use storage::Storage;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = setup_tracing::setup_tracing(&cli.command, &cli.log_dir) {
        eprintln!("⚠️  Logging to file disabled: {e:#}");
    }

    match run_app(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    if let Commands::Version = cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let app_config = AppConfig::load_from_json(&cli.config)
        .with_context(|| format!("Failed to load application configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Backup {
            action: BackupAction::Run(args),
        } => {
            info!("🚀 Starting backup of {}", args.connection.descriptor());
            let target = args.to_target(&app_config)?;
            let location = backup::run_backup_flow(&app_config, &target)
                .await
                .context("Backup process failed")?;
            println!("✅ Backup stored at {location}");
        }
        Commands::Restore {
            action: RestoreAction::Run(args),
        } => {
            info!("🔄 Starting restore of {} into {}", args.file, args.connection.descriptor());
            restore::run_restore_flow(&app_config, &args)
                .await
                .context("Restore process failed")?;
            println!("✅ Restore completed successfully.");
        }
        Commands::Storage {
            action: StorageAction::List(args),
        } => {
            let destination = args.resolve(&app_config)?;
            let sink = Storage::new(app_config.s3.clone());
            storage::run_list_flow(&sink, &destination)
                .await
                .with_context(|| format!("Failed to list backups at {destination}"))?;
        }
        Commands::Schedule {
            action: ScheduleAction::Start(args),
        } => {
            scheduler::run_schedule_flow(app_config, &args)
                .await
                .context("Scheduler failed")?;
            println!("✅ Scheduler stopped.");
        }
        Commands::Version => {}
    }
    Ok(())
}
