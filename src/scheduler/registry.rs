use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info};

use crate::backup::BackupTarget;
use crate::errors::SchedulerError;

use super::clock::Clock;
use super::job::{InvocationState, JobId, JobStatus, RunResult, ScheduledJob};
use super::trigger::Trigger;

struct JobEntry {
    job: ScheduledJob,
    /// Occurrences at or before this instant have been considered.
    last_evaluated: DateTime<Utc>,
    /// Became due while an invocation was in flight.
    pending: bool,
}

struct RegistryState {
    next_id: JobId,
    jobs: BTreeMap<JobId, JobEntry>,
}

/// In-memory set of recurring backup jobs. Ids are allocated from 1 and never
/// reused; the map is ordered by id, which is registration order.
pub struct JobRegistry {
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(RegistryState {
                next_id: 1,
                jobs: BTreeMap::new(),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // No invariant spans a panic point inside the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a job. Nothing changes unless both the trigger and the target are valid.
    pub fn add(&self, trigger_expression: &str, target: BackupTarget) -> Result<JobId, SchedulerError> {
        let registered_at = self.clock.now().trunc_subsecs(0);
        let trigger = Trigger::parse(trigger_expression, registered_at)?;
        target
            .connection
            .validate()
            .map_err(SchedulerError::InvalidTarget)?;

        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        info!(
            job_id = id,
            "Scheduled '{}' backup of {} to {}", trigger_expression, target.connection, target.destination
        );
        state.jobs.insert(
            id,
            JobEntry {
                job: ScheduledJob {
                    id,
                    trigger_expression: trigger_expression.to_string(),
                    trigger,
                    target,
                    status: JobStatus::Active,
                    last_run_result: None,
                    registered_at,
                    run_count: 0,
                    invocation: None,
                },
                last_evaluated: registered_at,
                pending: false,
            },
        );
        Ok(id)
    }

    /// Evicts the job and returns its final snapshot. An in-flight invocation
    /// keeps running; its result is dropped.
    pub fn remove(&self, id: JobId) -> Result<ScheduledJob, SchedulerError> {
        let entry = self.state().jobs.remove(&id).ok_or(SchedulerError::NotFound(id))?;
        let mut job = entry.job;
        job.status = JobStatus::Removed;
        info!(job_id = id, "Removed job '{}'", job.trigger_expression);
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Result<ScheduledJob, SchedulerError> {
        self.state()
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(SchedulerError::NotFound(id))
    }

    pub fn list(&self) -> Vec<ScheduledJob> {
        self.state().jobs.values().map(|entry| entry.job.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    /// Advances every job's evaluation watermark to `now` and returns the jobs
    /// to dispatch, marking them Pending. A job already in flight is never
    /// returned; becoming due meanwhile leaves a single pending run behind.
    pub(crate) fn collect_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let mut state = self.state();
        let mut dispatch = Vec::new();
        for entry in state.jobs.values_mut() {
            let due = entry.job.trigger.is_due(entry.last_evaluated, now);
            if now > entry.last_evaluated {
                entry.last_evaluated = now;
            }

            if entry.job.invocation.is_some() {
                if due && !entry.pending {
                    debug!(job_id = entry.job.id, "Job is still running; coalescing this trigger");
                    entry.pending = true;
                }
                continue;
            }
            if due || entry.pending {
                entry.pending = false;
                entry.job.invocation = Some(InvocationState::Pending);
                dispatch.push(entry.job.clone());
            }
        }
        dispatch
    }

    /// Returns false when the job was removed before it could start.
    pub(crate) fn mark_running(&self, id: JobId) -> bool {
        match self.state().jobs.get_mut(&id) {
            Some(entry) => {
                entry.job.invocation = Some(InvocationState::Running);
                true
            }
            None => false,
        }
    }

    /// Stores the outcome of a finished invocation. Returns false (and drops
    /// the result) when the job no longer exists.
    pub(crate) fn record_result(&self, id: JobId, result: RunResult) -> bool {
        match self.state().jobs.get_mut(&id) {
            Some(entry) => {
                entry.job.last_run_result = Some(result);
                entry.job.run_count += 1;
                entry.job.invocation = None;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::clock::ManualClock;
    use crate::storage::Destination;
    use crate::utils::connection::test_descriptor;
    use chrono::{TimeDelta, TimeZone};

    fn target() -> BackupTarget {
        BackupTarget {
            connection: test_descriptor(),
            destination: Destination::Local {
                directory: "backups".into(),
            },
        }
    }

    fn registry() -> (Arc<ManualClock>, JobRegistry) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 30).unwrap()));
        let registry = JobRegistry::new(clock.clone());
        (clock, registry)
    }

    fn ids(jobs: &[ScheduledJob]) -> Vec<(JobId, String, JobStatus)> {
        jobs.iter()
            .map(|j| (j.id, j.trigger_expression.clone(), j.status))
            .collect()
    }

    #[test]
    fn add_then_list_contains_one_active_job() {
        let (_, registry) = registry();
        let id = registry.add("every minute", target()).unwrap();

        let jobs = registry.list();
        assert_eq!(ids(&jobs), vec![(id, "every minute".to_string(), JobStatus::Active)]);
        assert!(jobs[0].last_run_result.is_none());
    }

    #[test]
    fn ids_are_monotonic_and_not_reused() {
        let (_, registry) = registry();
        let first = registry.add("@daily", target()).unwrap();
        let second = registry.add("@hourly", target()).unwrap();
        registry.remove(second).unwrap();
        let third = registry.add("@weekly", target()).unwrap();
        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(
            registry.list().iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn invalid_trigger_leaves_registry_untouched() {
        let (_, registry) = registry();
        registry.add("@daily", target()).unwrap();
        let before = ids(&registry.list());

        for expression in ["0 0 0 * * * 2025", "@fortnightly"] {
            let err = registry.add(expression, target()).unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidTrigger { .. }));
        }
        assert_eq!(ids(&registry.list()), before);
        // The failed adds did not consume ids.
        assert_eq!(registry.add("@daily", target()).unwrap(), 2);
    }

    #[test]
    fn invalid_target_is_rejected() {
        let (_, registry) = registry();
        let mut bad = target();
        bad.connection.dbname = String::new();
        assert!(matches!(
            registry.add("@daily", bad),
            Err(SchedulerError::InvalidTarget(_))
        ));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn remove_unknown_id_is_not_found() {
        let (_, registry) = registry();
        registry.add("@daily", target()).unwrap();
        let before = ids(&registry.list());

        assert_eq!(registry.remove(42).unwrap_err(), SchedulerError::NotFound(42));
        assert_eq!(registry.get(42).unwrap_err(), SchedulerError::NotFound(42));
        assert_eq!(ids(&registry.list()), before);
    }

    #[test]
    fn remove_returns_removed_snapshot() {
        let (_, registry) = registry();
        let id = registry.add("@daily", target()).unwrap();
        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.status, JobStatus::Removed);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn consecutive_lists_are_identical() {
        let (_, registry) = registry();
        registry.add("@daily", target()).unwrap();
        registry.add("*/5 * * * *", target()).unwrap();
        assert_eq!(ids(&registry.list()), ids(&registry.list()));
    }

    #[test]
    fn collect_due_fires_once_per_occurrence() {
        let (clock, registry) = registry();
        let id = registry.add("every minute", target()).unwrap();

        clock.advance(TimeDelta::seconds(29));
        assert!(registry.collect_due(clock.now()).is_empty());

        clock.advance(TimeDelta::seconds(1));
        let due = registry.collect_due(clock.now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].invocation, Some(InvocationState::Pending));

        // Same instant again: nothing new, and the job is in flight anyway.
        assert!(registry.collect_due(clock.now()).is_empty());

        assert!(registry.mark_running(id));
        assert!(registry.record_result(
            id,
            RunResult::Succeeded {
                finished_at: clock.now(),
                artifact: "backups/inventory.sql.gz".into()
            }
        ));
        assert!(registry.collect_due(clock.now()).is_empty());

        let job = registry.get(id).unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.invocation, None);
    }

    #[test]
    fn due_while_in_flight_coalesces_into_one_pending_run() {
        let (clock, registry) = registry();
        let id = registry.add("* * * * * *", target()).unwrap();

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(registry.collect_due(clock.now()).len(), 1);
        registry.mark_running(id);

        for _ in 0..5 {
            clock.advance(TimeDelta::seconds(1));
            assert!(registry.collect_due(clock.now()).is_empty());
        }

        registry.record_result(
            id,
            RunResult::Failed {
                finished_at: clock.now(),
                reason: "boom".into(),
            },
        );
        // No new occurrence, but the coalesced run is released.
        assert_eq!(registry.collect_due(clock.now()).len(), 1);
        registry.mark_running(id);
        registry.record_result(
            id,
            RunResult::Failed {
                finished_at: clock.now(),
                reason: "boom".into(),
            },
        );
        assert!(registry.collect_due(clock.now()).is_empty());
    }

    #[test]
    fn results_for_removed_jobs_are_discarded() {
        let (clock, registry) = registry();
        let id = registry.add("every minute", target()).unwrap();
        clock.advance(TimeDelta::seconds(30));
        registry.collect_due(clock.now());
        registry.remove(id).unwrap();

        assert!(!registry.mark_running(id));
        assert!(!registry.record_result(
            id,
            RunResult::Failed {
                finished_at: clock.now(),
                reason: "late".into()
            }
        ));
        assert!(registry.list().is_empty());
    }
}
