use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use time::macros::format_description;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::Commands;

const LOG_FILE_NAME: &str = "pgguard.log";

/// Installs the global subscriber: compact console output plus a plain-text
/// copy appended to `<log_dir>/pgguard.log`. `RUST_LOG` overrides the level.
pub fn setup_tracing(command: &Commands, log_dir: &Path) -> Result<()> {
    let default_level = match command {
        Commands::Version => "error",
        Commands::Backup { .. }
        | Commands::Restore { .. }
        | Commands::Storage { .. }
        | Commands::Schedule { .. } => "info",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level))
        // Filter out noisy third-party logs
        .add_directive("sqlx::postgres::notice=warn".parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?);

    let log_file = open_log_file(log_dir);

    let timer = OffsetTime::new(
        time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    );

    let console_layer = fmt::layer()
        .with_target(false)
        .with_ansi(true)
        .with_timer(timer.clone())
        .compact();

    // Console output stays on even when the log file is unavailable.
    let (file_layer, file_error) = match log_file {
        Ok(file) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_timer(timer)
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    match file_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn open_log_file(log_dir: &Path) -> Result<File> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))
}
