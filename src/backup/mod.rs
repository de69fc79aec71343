pub(crate) mod archive; // gzip compression of dump files
pub(crate) mod db_dump; // pg_dump based executor

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{ExecutionError, InvocationError};
use crate::storage::{Destination, Storage, StorageSink};
use crate::utils::connection::ConnectionDescriptor;

pub use db_dump::PgDumpExecutor;

/// What to back up and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub connection: ConnectionDescriptor,
    pub destination: Destination,
}

/// Produces a dump artifact for one database.
#[async_trait]
pub trait BackupExecutor: Send + Sync {
    /// Writes the artifact into `output_dir` and returns its path.
    async fn execute(
        &self,
        connection: &ConnectionDescriptor,
        output_dir: &Path,
    ) -> Result<PathBuf, ExecutionError>;
}

/// Dumps the target database and, for remote destinations, hands the artifact
/// to the sink. Local destinations are written in place. Returns the final
/// location of the artifact.
pub async fn perform_backup(
    executor: &dyn BackupExecutor,
    sink: &dyn StorageSink,
    staging_dir: &Path,
    target: &BackupTarget,
) -> Result<String, InvocationError> {
    let output_dir = match &target.destination {
        Destination::Local { directory } => directory.as_path(),
        Destination::S3 { .. } => staging_dir,
    };

    let artifact = executor.execute(&target.connection, output_dir).await?;

    if !target.destination.is_remote() {
        return Ok(artifact.display().to_string());
    }

    match sink.put(&artifact, &target.destination).await {
        Ok(location) => Ok(location),
        Err(e) => {
            // The staged dump is only kept until it reaches the destination.
            match tokio::fs::remove_file(&artifact).await {
                Ok(()) => debug!("Removed staged dump {} after failed upload", artifact.display()),
                Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                Err(rm) => warn!("Failed to remove staged dump {}: {}", artifact.display(), rm),
            }
            Err(e.into())
        }
    }
}

/// `backup run`: one backup outside the scheduler.
pub async fn run_backup_flow(app_config: &AppConfig, target: &BackupTarget) -> anyhow::Result<String> {
    let executor = PgDumpExecutor;
    let sink = Storage::new(app_config.s3.clone());

    perform_backup(&executor, &sink, &app_config.local_backup_dir, target)
        .await
        .with_context(|| format!("Backup of {} to {} failed", target.connection, target.destination))
}
