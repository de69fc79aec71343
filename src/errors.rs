use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::JobId;

/// Errors surfaced synchronously by the job registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid trigger expression '{expression}': {reason}")]
    InvalidTrigger { expression: String, reason: String },

    #[error("no scheduled job with id {0}")]
    NotFound(JobId),

    #[error("invalid backup target: {0}")]
    InvalidTarget(String),
}

impl SchedulerError {
    pub fn invalid_trigger(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTrigger {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures of the dump/restore tooling: connectivity, authentication, disk.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{tool} executable not found in PATH. Please ensure PostgreSQL client tools are installed")]
    ToolNotFound {
        tool: &'static str,
        #[source]
        source: which::Error,
    },

    #[error("could not connect to database: {0}")]
    Connection(String),

    #[error("{tool} failed with {status}: {stderr}")]
    Tool {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("I/O error while {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid connection parameters: {0}")]
    InvalidTarget(String),
}

impl ExecutionError {
    pub fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }
}

/// Failures of the storage sink: network, permissions, missing bucket or path.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("S3 {operation} failed for s3://{bucket}/{key}: {message}")]
    S3 {
        operation: &'static str,
        bucket: String,
        key: String,
        message: String,
    },

    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("storage misconfigured: {0}")]
    Config(String),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Outcome of a failed backup invocation, either stage.
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
