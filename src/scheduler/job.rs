use chrono::{DateTime, Utc};

use crate::backup::BackupTarget;

use super::trigger::Trigger;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Active,
    Removed,
}

/// Where an invocation is between dispatch and completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Dispatched, waiting for a concurrency permit.
    Pending,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Succeeded {
        finished_at: DateTime<Utc>,
        /// Final location of the dump: a local path or an `s3://` URL.
        artifact: String,
    },
    Failed {
        finished_at: DateTime<Utc>,
        reason: String,
    },
}

impl RunResult {
    pub fn summary(&self) -> String {
        match self {
            RunResult::Succeeded { finished_at, artifact } => {
                format!("succeeded at {} -> {}", finished_at.format("%Y-%m-%d %H:%M:%S UTC"), artifact)
            }
            RunResult::Failed { finished_at, reason } => {
                format!("failed at {}: {}", finished_at.format("%Y-%m-%d %H:%M:%S UTC"), reason)
            }
        }
    }
}

/// Snapshot of a registered recurring backup.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: JobId,
    pub trigger_expression: String,
    pub trigger: Trigger,
    pub target: BackupTarget,
    pub status: JobStatus,
    pub last_run_result: Option<RunResult>,
    pub registered_at: DateTime<Utc>,
    pub run_count: u64,
    pub invocation: Option<InvocationState>,
}

impl ScheduledJob {
    /// One line for the console's `list`.
    pub fn describe(&self) -> String {
        let last = match (&self.invocation, &self.last_run_result) {
            (Some(InvocationState::Running), _) => "running".to_string(),
            (Some(InvocationState::Pending), _) => "waiting to run".to_string(),
            (None, Some(result)) => result.summary(),
            (None, None) => "never run".to_string(),
        };
        format!(
            "[{}] '{}' {} -> {} | runs: {} | {}",
            self.id, self.trigger_expression, self.target.connection, self.target.destination, self.run_count, last
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Destination;
    use crate::utils::connection::test_descriptor;
    use chrono::TimeZone;

    #[test]
    fn describe_shows_last_result() {
        let registered_at = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        let mut job = ScheduledJob {
            id: 7,
            trigger_expression: "@daily".into(),
            trigger: Trigger::parse("@daily", registered_at).unwrap(),
            target: BackupTarget {
                connection: test_descriptor(),
                destination: Destination::Local {
                    directory: "backups".into(),
                },
            },
            status: JobStatus::Active,
            last_run_result: None,
            registered_at,
            run_count: 0,
            invocation: None,
        };
        assert!(job.describe().ends_with("never run"));
        assert!(!job.describe().contains("s3cr3t"));

        job.last_run_result = Some(RunResult::Failed {
            finished_at: registered_at,
            reason: "connection refused".into(),
        });
        job.run_count = 1;
        assert_eq!(
            job.describe(),
            "[7] '@daily' postgres://guard@localhost:5432/inventory -> local:backups | runs: 1 | failed at 2025-01-06 10:00:00 UTC: connection refused"
        );
    }
}
