//! Recurring backups: job registry, trigger evaluation, the tick loop and the
//! interactive console that drives them.

pub(crate) mod clock;
pub(crate) mod console;
pub(crate) mod job;
pub(crate) mod registry;
pub(crate) mod runner;
pub(crate) mod trigger;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::backup::PgDumpExecutor;
use crate::cli::StartArgs;
use crate::config::AppConfig;
use crate::storage::Storage;

pub use job::JobId;

use clock::SystemClock;
use console::JobConsole;
use registry::JobRegistry;
use runner::Scheduler;

/// `schedule start`: registers the configured jobs, runs the scheduler and
/// blocks on the console (or Ctrl-C), then drains running backups.
pub async fn run_schedule_flow(mut app_config: AppConfig, args: &StartArgs) -> Result<()> {
    app_config
        .override_scheduler(args.tick_secs, args.max_concurrent)
        .context("Invalid scheduler settings")?;

    let registry = Arc::new(JobRegistry::new(Arc::new(SystemClock)));
    for (index, job) in app_config.jobs.iter().enumerate() {
        let target = job
            .target
            .to_target(&app_config)
            .with_context(|| format!("Configured job #{} has an invalid target", index + 1))?;
        registry
            .add(&job.trigger, target)
            .with_context(|| format!("Configured job #{} could not be scheduled", index + 1))?;
    }
    info!("{} job(s) loaded from configuration", registry.len());

    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        Arc::new(PgDumpExecutor),
        Arc::new(Storage::new(app_config.s3.clone())),
        &app_config.scheduler,
        app_config.local_backup_dir.clone(),
    );
    scheduler.start();

    if args.no_console {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Ctrl-C received");
    } else {
        let console = JobConsole::new(Arc::clone(scheduler.registry()), app_config);
        tokio::task::spawn_blocking(move || console.start_interactive())
            .await
            .context("Console task failed")?
            .context("Console input failed")?;
    }

    scheduler.shutdown().await;
    Ok(())
}
