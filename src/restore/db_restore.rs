// pgguard/src/restore/db_restore.rs
use std::path::Path;

use sqlx::{Connection, PgConnection};
use tokio::process::Command;
use tracing::{info, warn};

use crate::backup::archive;
use crate::errors::ExecutionError;
use crate::utils::connection::ConnectionDescriptor;
use crate::utils::{find_executable, run_tool};

const MAINTENANCE_DATABASE: &str = "postgres";
const PROTECTED_DATABASES: &[&str] = &["postgres", "template0", "template1"];

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Drop the target database first when it already exists.
    pub drop_existing: bool,
}

/// Restores `dump_path` (`.sql` or `.sql.gz`) into the database named by `connection`.
pub async fn restore_database(
    connection: &ConnectionDescriptor,
    dump_path: &Path,
    options: &RestoreOptions,
) -> Result<(), ExecutionError> {
    if !tokio::fs::try_exists(dump_path).await.unwrap_or(false) {
        return Err(ExecutionError::io(
            format!("opening dump {}", dump_path.display()),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    }
    let psql_path = find_executable("psql")?;
    connection
        .check_connection_to(MAINTENANCE_DATABASE)
        .await?;

    // Decompressed copy lives only as long as this restore.
    let scratch = tempfile::tempdir().map_err(|e| ExecutionError::io("creating scratch directory", e))?;
    let sql_path = if archive::is_gzip(dump_path) {
        archive::decompress_dump(dump_path.to_path_buf(), scratch.path().join("backup.sql")).await?
    } else {
        dump_path.to_path_buf()
    };

    manage_target_database(connection, options).await?;

    info!("Replaying {} into {}", sql_path.display(), connection);
    let url = connection.url()?;
    let mut command = Command::new(psql_path);
    command
        .arg("-X") // Do not read psqlrc
        .arg("-q")
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg("-d")
        .arg(url.as_str())
        .arg("-f")
        .arg(&sql_path);
    run_tool("psql", &mut command).await?;

    info!("Successfully restored {} from {}", connection, dump_path.display());
    Ok(())
}

/// Drops (when requested) and creates the target database through the
/// maintenance database. Returns true when the database was (re)created.
pub async fn manage_target_database(
    connection: &ConnectionDescriptor,
    options: &RestoreOptions,
) -> Result<bool, ExecutionError> {
    let db_name = connection.dbname.as_str();
    let admin_url = connection.url_for_database(MAINTENANCE_DATABASE)?;
    let mut admin = PgConnection::connect(admin_url.as_str())
        .await
        .map_err(|e| ExecutionError::Connection(e.to_string()))?;

    let db_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(db_name)
        .fetch_one(&mut admin)
        .await
        .map_err(|e| ExecutionError::Connection(format!("checking whether '{db_name}' exists: {e}")))?;

    if db_exists && !options.drop_existing {
        info!("Database '{}' exists; restoring into it without dropping", db_name);
        return Ok(false);
    }

    if db_exists {
        if PROTECTED_DATABASES.iter().any(|p| db_name.eq_ignore_ascii_case(p)) {
            return Err(ExecutionError::InvalidTarget(format!(
                "refusing to drop system database '{db_name}'; pass --keep-existing to restore into it"
            )));
        }

        info!("Dropping database '{}'", db_name);
        sqlx::query("SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()")
            .bind(db_name)
            .execute(&mut admin)
            .await
            .map_err(|e| ExecutionError::Connection(format!("terminating sessions on '{db_name}': {e}")))?;
        sqlx::query(&format!(r#"DROP DATABASE IF EXISTS "{}""#, quote_identifier(db_name)))
            .execute(&mut admin)
            .await
            .map_err(|e| ExecutionError::Connection(format!("dropping '{db_name}': {e}")))?;
    }

    info!("Creating database '{}'", db_name);
    sqlx::query(&format!(
        r#"CREATE DATABASE "{}" OWNER "{}""#,
        quote_identifier(db_name),
        quote_identifier(&connection.username)
    ))
    .execute(&mut admin)
    .await
    .map_err(|e| ExecutionError::Connection(format!("creating '{db_name}': {e}")))?;

    if let Err(e) = admin.close().await {
        warn!("Failed to close admin connection cleanly: {}", e);
    }
    Ok(true)
}

fn quote_identifier(identifier: &str) -> String {
    identifier.replace('"', "\"\"")
}
