// pgguard/src/backup/db_dump.rs
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{BackupExecutor, archive};
use crate::errors::ExecutionError;
use crate::utils::connection::ConnectionDescriptor;
use crate::utils::{find_executable, run_tool};

/// Full logical dump of one database with `pg_dump`, gzip-compressed.
///
/// The artifact is named `<dbname>-<YYYYMMDDTHHMMSS>.sql.gz`. The dump is
/// written with `--clean --if-exists` so it can be replayed over an existing
/// database.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDumpExecutor;

#[async_trait]
impl BackupExecutor for PgDumpExecutor {
    async fn execute(
        &self,
        connection: &ConnectionDescriptor,
        output_dir: &Path,
    ) -> Result<PathBuf, ExecutionError> {
        let pg_dump_path = find_executable("pg_dump")?;
        connection.check_connection().await?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ExecutionError::io(format!("creating output directory {}", output_dir.display()), e))?;

        let stem = dump_file_stem(&connection.dbname, &Local::now());
        // Concurrent jobs for the same database can share a directory and a
        // timestamp: each invocation claims its own final name and dumps into
        // a private scratch directory.
        let scratch = tempfile::Builder::new()
            .prefix(".pgguard-dump-")
            .tempdir_in(output_dir)
            .map_err(|e| ExecutionError::io(format!("creating scratch directory in {}", output_dir.display()), e))?;
        let gz_path = reserve_artifact_path(output_dir, &stem).await?;
        let sql_path = scratch.path().join(format!("{stem}.sql"));

        let scratch_gz = scratch.path().join(format!("{stem}.sql.gz"));
        let moved = match dump_into(&pg_dump_path, connection, &sql_path, scratch_gz).await {
            Ok(compressed) => tokio::fs::rename(&compressed, &gz_path)
                .await
                .map_err(|e| ExecutionError::io(format!("moving dump to {}", gz_path.display()), e)),
            Err(e) => Err(e),
        };
        if let Err(e) = moved {
            // Cleanup on failure
            if let Err(remove_err) = tokio::fs::remove_file(&gz_path).await {
                debug!("Could not release {}: {}", gz_path.display(), remove_err);
            }
            return Err(e);
        }
        let artifact = gz_path;

        match tokio::fs::metadata(&artifact).await {
            Ok(meta) => info!("Backup of {} saved to {} ({} bytes)", connection, artifact.display(), meta.len()),
            Err(e) => warn!("Backup written but could not stat {}: {}", artifact.display(), e),
        }
        Ok(artifact)
    }
}

async fn dump_into(
    pg_dump_path: &Path,
    connection: &ConnectionDescriptor,
    sql_path: &Path,
    gz_path: PathBuf,
) -> Result<PathBuf, ExecutionError> {
    info!("Dumping {} to {}", connection, sql_path.display());
    let url = connection.url()?;
    let mut command = Command::new(pg_dump_path);
    command
        .arg("--no-password")
        .arg("--clean")
        .arg("--if-exists")
        .arg("-f")
        .arg(sql_path)
        .arg(url.as_str());
    run_tool("pg_dump", &mut command).await?;

    archive::compress_dump(sql_path.to_path_buf(), gz_path).await
}

/// Atomically claims `<stem>.sql.gz` in `dir`, or `<stem>-<n>.sql.gz` when
/// that name is taken. The returned path exists as an empty placeholder.
pub async fn reserve_artifact_path(dir: &Path, stem: &str) -> Result<PathBuf, ExecutionError> {
    let mut attempt = 0u32;
    loop {
        let candidate = match attempt {
            0 => dir.join(format!("{stem}.sql.gz")),
            n => dir.join(format!("{stem}-{n}.sql.gz")),
        };
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(ExecutionError::io(format!("creating {}", candidate.display()), e)),
        }
    }
}

/// `<dbname>-<YYYYMMDDTHHMMSS>`
pub fn dump_file_stem<Tz: TimeZone>(dbname: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}-{}", dbname, at.format("%Y%m%dT%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn stem_uses_compact_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(dump_file_stem("inventory", &at), "inventory-20250309T140507");
    }

    #[tokio::test]
    async fn invalid_target_fails_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let connection = ConnectionDescriptor {
            host: "localhost".into(),
            port: 5432,
            username: "guard".into(),
            password: String::new(),
            dbname: "inventory".into(),
        };
        let output_dir = dir.path().join("out");

        let err = PgDumpExecutor.execute(&connection, &output_dir).await.unwrap_err();

        // Either pg_dump is missing on this machine or the descriptor is rejected.
        assert!(matches!(
            err,
            ExecutionError::ToolNotFound { .. } | ExecutionError::InvalidTarget(_)
        ));
        assert!(!output_dir.exists());
    }

    #[tokio::test]
    async fn same_stem_reservations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = tokio::join!(
            reserve_artifact_path(dir.path(), "app-20250309T140507"),
            reserve_artifact_path(dir.path(), "app-20250309T140507"),
            reserve_artifact_path(dir.path(), "app-20250309T140507"),
        );
        let mut names: Vec<String> = [a, b, c]
            .into_iter()
            .map(|p| p.unwrap().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "app-20250309T140507-1.sql.gz",
                "app-20250309T140507-2.sql.gz",
                "app-20250309T140507.sql.gz",
            ]
        );
    }
}
