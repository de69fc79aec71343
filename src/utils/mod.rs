pub mod connection;

use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;
use which::which;

use crate::errors::ExecutionError;

/// Finds a PostgreSQL client tool (`pg_dump`, `psql`) in the system PATH.
pub fn find_executable(tool: &'static str) -> Result<PathBuf, ExecutionError> {
    let path = which(tool).map_err(|source| ExecutionError::ToolNotFound { tool, source })?;
    debug!("Found {} executable at {}", tool, path.display());
    Ok(path)
}

/// Runs a prepared client tool command to completion, turning a non-zero
/// exit into an [`ExecutionError::Tool`] carrying its stderr.
pub async fn run_tool(tool: &'static str, command: &mut Command) -> Result<(), ExecutionError> {
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutionError::io(format!("executing {tool}"), e))?;

    if !output.status.success() {
        return Err(ExecutionError::Tool {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
