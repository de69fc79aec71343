pub(crate) mod db_restore; // drop/create of the target database and psql replay

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::RestoreArgs;
use crate::config::AppConfig;
use crate::storage::{Storage, StorageSink};

pub use db_restore::RestoreOptions;

/// `restore run`: optionally fetches the dump from storage, then recreates the
/// target database from it.
pub async fn run_restore_flow(app_config: &AppConfig, args: &RestoreArgs) -> Result<()> {
    let connection = args.connection.descriptor();
    connection.validate().map_err(anyhow::Error::msg)?;

    // Holds a downloaded dump until the restore finishes.
    let download_dir = tempfile::Builder::new()
        .prefix("pgguard_restore_")
        .tempdir()
        .context("Failed to create temporary download directory")?;

    let dump_path = if args.from_storage {
        let destination = args.destination.resolve(app_config)?;
        let sink = Storage::new(app_config.s3.clone());
        let local_path = download_dir.path().join(download_file_name(&args.file));
        info!("Fetching {} from {}", args.file, destination);
        sink.get(&args.file, &destination, &local_path)
            .await
            .with_context(|| format!("Failed to fetch {} from {}", args.file, destination))?
    } else {
        PathBuf::from(&args.file)
    };

    let options = RestoreOptions {
        drop_existing: !args.keep_existing,
    };
    db_restore::restore_database(&connection, &dump_path, &options)
        .await
        .with_context(|| format!("Restore of {} from {} failed", connection, dump_path.display()))?;

    info!("Restored {} from {}", connection, args.file);
    Ok(())
}

/// Object keys may carry a prefix; only the last segment names the local file.
fn download_file_name(object_name: &str) -> &str {
    Path::new(object_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("backup.sql")
}
