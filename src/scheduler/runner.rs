use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::SubsecRound;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupExecutor, perform_backup};
use crate::config::SchedulerSettings;
use crate::storage::StorageSink;

use super::job::{RunResult, ScheduledJob};
use super::registry::JobRegistry;

/// Everything an invocation needs, shared by all of them.
struct InvocationContext {
    executor: Arc<dyn BackupExecutor>,
    sink: Arc<dyn StorageSink>,
    /// Where dumps bound for remote destinations are written before upload.
    staging_dir: PathBuf,
    permits: Arc<Semaphore>,
}

/// Drives a [`JobRegistry`]: a background tick loop finds due jobs and runs
/// each as its own task, at most `max_concurrent_jobs` at a time.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    context: Arc<InvocationContext>,
    tick_interval: Duration,
    tasks: Arc<Mutex<JoinSet<()>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        executor: Arc<dyn BackupExecutor>,
        sink: Arc<dyn StorageSink>,
        settings: &SchedulerSettings,
        staging_dir: PathBuf,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            context: Arc::new(InvocationContext {
                executor,
                sink,
                staging_dir,
                permits: Arc::new(Semaphore::new(settings.max_concurrent_jobs)),
            }),
            tick_interval: settings.tick_interval,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Spawns the tick loop. Calling it again while it runs does nothing.
    pub fn start(&self) {
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let scheduler = self.clone();

        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Scheduler started, ticking every {:?}", scheduler.tick_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.tick();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Tick loop stopped");
        }));
    }

    /// One evaluation pass: dispatches every due job and returns how many
    /// were dispatched.
    pub fn tick(&self) -> usize {
        let now = self.registry.clock().now().trunc_subsecs(0);
        let due = self.registry.collect_due(now);

        let mut tasks = lock(&self.tasks);
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Invocation task ended abnormally: {}", e);
            }
        }
        let dispatched = due.len();
        for job in due {
            debug!(job_id = job.id, "Dispatching '{}'", job.trigger_expression);
            tasks.spawn(invoke(Arc::clone(&self.registry), Arc::clone(&self.context), job));
        }
        dispatched
    }

    /// Waits until no invocation is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let mut running = std::mem::replace(&mut *lock(&self.tasks), JoinSet::new());
            if running.is_empty() {
                return;
            }
            while let Some(finished) = running.join_next().await {
                if let Err(e) = finished {
                    error!("Invocation task ended abnormally: {}", e);
                }
            }
        }
    }

    /// Stops the tick loop, then waits for in-flight invocations to finish.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let ticker = lock(&self.ticker).take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!("Tick loop ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopping; waiting for running backups");
        self.wait_idle().await;
        info!("Scheduler stopped");
    }
}

/// Runs one job to completion and records the outcome. Never fails: every
/// error, panics included, becomes a [`RunResult::Failed`].
async fn invoke(registry: Arc<JobRegistry>, context: Arc<InvocationContext>, job: ScheduledJob) {
    let Ok(_permit) = Arc::clone(&context.permits).acquire_owned().await else {
        warn!(job_id = job.id, "Concurrency limiter closed; skipping run");
        return;
    };
    if !registry.mark_running(job.id) {
        debug!(job_id = job.id, "Job was removed before it started");
        return;
    }

    info!(job_id = job.id, "Backing up {} to {}", job.target.connection, job.target.destination);
    let started = Instant::now();
    let target = job.target.clone();
    let task_context = Arc::clone(&context);
    let outcome = tokio::spawn(async move {
        perform_backup(
            task_context.executor.as_ref(),
            task_context.sink.as_ref(),
            &task_context.staging_dir,
            &target,
        )
        .await
    })
    .await;

    let finished_at = registry.clock().now();
    let result = match outcome {
        Ok(Ok(artifact)) => {
            info!(job_id = job.id, "Backup finished in {:.2?}: {}", started.elapsed(), artifact);
            RunResult::Succeeded { finished_at, artifact }
        }
        Ok(Err(e)) => {
            let reason = error_chain(&e);
            error!(job_id = job.id, "Backup failed after {:.2?}: {}", started.elapsed(), reason);
            RunResult::Failed { finished_at, reason }
        }
        Err(e) => {
            error!(job_id = job.id, "Backup task panicked: {}", e);
            RunResult::Failed {
                finished_at,
                reason: format!("backup task panicked: {e}"),
            }
        }
    };

    if !registry.record_result(job.id, result) {
        info!(job_id = job.id, "Job was removed while running; result discarded");
    }
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !rendered.contains(&cause_text) {
            rendered.push_str(": ");
            rendered.push_str(&cause_text);
        }
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupTarget;
    use crate::errors::{ExecutionError, SchedulerError, StorageError};
    use crate::scheduler::clock::{Clock, ManualClock};
    use crate::scheduler::job::{JobStatus, RunResult};
    use crate::storage::Destination;
    use crate::utils::connection::{ConnectionDescriptor, test_descriptor};
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeExecutor {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        /// One permit per start, so tests can wait for N executions to begin.
        started: Arc<Semaphore>,
        /// When set, each execution consumes one permit before finishing.
        gate: Option<Arc<Semaphore>>,
        fail_with: Option<String>,
        panic: bool,
    }

    impl Default for FakeExecutor {
        fn default() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                started: Arc::new(Semaphore::new(0)),
                gate: None,
                fail_with: None,
                panic: false,
            }
        }
    }

    impl FakeExecutor {
        fn gated(gate: &Arc<Semaphore>) -> Self {
            Self {
                gate: Some(Arc::clone(gate)),
                ..Self::default()
            }
        }

        async fn wait_started(&self, n: u32) {
            self.started.acquire_many(n).await.unwrap().forget();
        }
    }

    #[async_trait]
    impl BackupExecutor for FakeExecutor {
        async fn execute(
            &self,
            connection: &ConnectionDescriptor,
            output_dir: &Path,
        ) -> Result<PathBuf, ExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            self.started.add_permits(1);

            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panic {
                panic!("executor exploded");
            }
            if let Some(message) = &self.fail_with {
                return Err(ExecutionError::Connection(message.clone()));
            }
            let path = output_dir.join(format!("{}-{call}.sql.gz", connection.dbname));
            tokio::fs::write(&path, b"dump")
                .await
                .map_err(|e| ExecutionError::io("writing dump", e))?;
            Ok(path)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        puts: Mutex<Vec<String>>,
        /// Reject every upload as an unreachable endpoint would.
        unreachable: bool,
    }

    #[async_trait]
    impl StorageSink for RecordingSink {
        async fn put(&self, artifact: &Path, destination: &Destination) -> Result<String, StorageError> {
            let file_name = artifact.file_name().unwrap().to_string_lossy();
            if self.unreachable {
                return Err(StorageError::S3 {
                    operation: "PutObject",
                    bucket: "db-backups".into(),
                    key: file_name.into_owned(),
                    message: "dispatch failure: Connection refused".into(),
                });
            }
            let location = match destination {
                Destination::S3 { bucket, .. } => format!("s3://{}/{}", bucket, destination.object_key(&file_name)),
                Destination::Local { directory } => directory.join(&*file_name).display().to_string(),
            };
            self.puts.lock().unwrap().push(location.clone());
            Ok(location)
        }

        async fn list(&self, _: &Destination) -> Result<Vec<String>, StorageError> {
            Ok(self.puts.lock().unwrap().clone())
        }

        async fn get(&self, name: &str, _: &Destination, _: &Path) -> Result<PathBuf, StorageError> {
            Err(StorageError::NotFound(name.to_string()))
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        registry: Arc<JobRegistry>,
        executor: Arc<FakeExecutor>,
        sink: Arc<RecordingSink>,
        scheduler: Scheduler,
        backups: tempfile::TempDir,
    }

    fn harness(executor: FakeExecutor, max_concurrent_jobs: usize) -> Harness {
        harness_with_sink(executor, RecordingSink::default(), max_concurrent_jobs)
    }

    fn harness_with_sink(executor: FakeExecutor, sink: RecordingSink, max_concurrent_jobs: usize) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 30).unwrap()));
        let registry = Arc::new(JobRegistry::new(clock.clone()));
        let executor = Arc::new(executor);
        let sink = Arc::new(sink);
        let backups = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            executor.clone(),
            sink.clone(),
            &SchedulerSettings {
                tick_interval: Duration::from_secs(1),
                max_concurrent_jobs,
            },
            backups.path().to_path_buf(),
        );
        Harness {
            clock,
            registry,
            executor,
            sink,
            scheduler,
            backups,
        }
    }

    impl Harness {
        fn local_target(&self) -> BackupTarget {
            BackupTarget {
                connection: test_descriptor(),
                destination: Destination::Local {
                    directory: self.backups.path().to_path_buf(),
                },
            }
        }

        /// Advances the clock one second at a time, ticking after each step.
        async fn run_for(&self, seconds: i64) -> usize {
            let mut dispatched = 0;
            for _ in 0..seconds {
                self.clock.advance(TimeDelta::seconds(1));
                dispatched += self.scheduler.tick();
                tokio::task::yield_now().await;
            }
            dispatched
        }
    }

    #[tokio::test]
    async fn every_minute_job_runs_once_in_sixty_one_seconds() {
        let h = harness(FakeExecutor::default(), 2);
        let id = h.registry.add("every minute", h.local_target()).unwrap();

        assert_eq!(h.run_for(61).await, 1);
        h.scheduler.wait_idle().await;

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        let job = h.registry.get(id).unwrap();
        assert_eq!(job.run_count, 1);
        let Some(RunResult::Succeeded { artifact, .. }) = job.last_run_result else {
            panic!("expected success, got {:?}", job.last_run_result);
        };
        assert_eq!(PathBuf::from(&artifact), h.backups.path().join("inventory-1.sql.gz"));
        assert!(Path::new(&artifact).exists());
        assert!(h.sink.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn executor_failure_is_recorded_and_job_stays_active() {
        let h = harness(
            FakeExecutor {
                fail_with: Some("connection refused".into()),
                ..FakeExecutor::default()
            },
            2,
        );
        let id = h.registry.add("every minute", h.local_target()).unwrap();

        h.run_for(30).await;
        h.scheduler.wait_idle().await;

        let job = h.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Active);
        let Some(RunResult::Failed { reason, .. }) = &job.last_run_result else {
            panic!("expected failure, got {:?}", job.last_run_result);
        };
        assert!(reason.contains("connection refused"), "{reason}");
        assert_eq!(h.registry.list().len(), 1);

        // Still scheduling: the next minute runs again.
        h.run_for(60).await;
        h.scheduler.wait_idle().await;
        assert_eq!(h.registry.get(id).unwrap().run_count, 2);
    }

    #[tokio::test]
    async fn removing_a_running_job_discards_its_result() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeExecutor::gated(&gate), 2);
        let id = h.registry.add("every minute", h.local_target()).unwrap();

        h.run_for(30).await;
        h.executor.wait_started(1).await;

        let removed = h.registry.remove(id).unwrap();
        assert_eq!(removed.status, JobStatus::Removed);
        assert!(h.registry.list().is_empty());

        gate.add_permits(1);
        h.scheduler.wait_idle().await;

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        assert!(h.registry.list().is_empty());
        assert_eq!(h.registry.get(id).unwrap_err(), SchedulerError::NotFound(id));
    }

    #[tokio::test]
    async fn slow_job_never_overlaps_itself() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeExecutor::gated(&gate), 4);
        let id = h.registry.add("* * * * * *", h.local_target()).unwrap();

        assert_eq!(h.run_for(1).await, 1);
        h.executor.wait_started(1).await;
        // Due on every one of these ticks while the first run is blocked.
        assert_eq!(h.run_for(5).await, 0);

        gate.add_permits(1);
        h.scheduler.wait_idle().await;
        assert_eq!(h.registry.get(id).unwrap().run_count, 1);

        // The missed triggers collapse into exactly one follow-up run.
        assert_eq!(h.scheduler.tick(), 1);
        assert_eq!(h.scheduler.tick(), 0);
        gate.add_permits(1);
        h.scheduler.wait_idle().await;

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.executor.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_permits() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeExecutor::gated(&gate), 2);
        for _ in 0..4 {
            h.registry.add("* * * * * *", h.local_target()).unwrap();
        }

        assert_eq!(h.run_for(1).await, 4);
        h.executor.wait_started(2).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.executor.running.load(Ordering::SeqCst), 2);

        gate.add_permits(4);
        h.scheduler.wait_idle().await;
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.executor.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remote_destination_goes_through_the_sink() {
        let h = harness(FakeExecutor::default(), 2);
        let target = BackupTarget {
            connection: test_descriptor(),
            destination: Destination::S3 {
                bucket: "db-backups".into(),
                prefix: Some("nightly".into()),
            },
        };
        let id = h.registry.add("every minute", target).unwrap();

        h.run_for(30).await;
        h.scheduler.wait_idle().await;

        let job = h.registry.get(id).unwrap();
        assert_eq!(
            job.last_run_result,
            Some(RunResult::Succeeded {
                finished_at: h.clock.now(),
                artifact: "s3://db-backups/nightly/inventory-1.sql.gz".into(),
            })
        );
        assert_eq!(h.sink.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_is_recorded_and_staging_is_cleaned() {
        let h = harness_with_sink(
            FakeExecutor::default(),
            RecordingSink {
                unreachable: true,
                ..RecordingSink::default()
            },
            2,
        );
        let target = BackupTarget {
            connection: test_descriptor(),
            destination: Destination::S3 {
                bucket: "db-backups".into(),
                prefix: None,
            },
        };
        let id = h.registry.add("every minute", target).unwrap();

        h.run_for(150).await;
        h.scheduler.wait_idle().await;

        let job = h.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.run_count, 3);
        let Some(RunResult::Failed { reason, .. }) = &job.last_run_result else {
            panic!("expected failure, got {:?}", job.last_run_result);
        };
        assert!(reason.starts_with("S3 PutObject failed"), "{reason}");
        assert!(reason.contains("Connection refused"), "{reason}");
        assert_eq!(std::fs::read_dir(h.backups.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn panicking_executor_is_recorded_as_failure() {
        let h = harness(
            FakeExecutor {
                panic: true,
                ..FakeExecutor::default()
            },
            1,
        );
        let id = h.registry.add("every minute", h.local_target()).unwrap();

        h.run_for(30).await;
        h.scheduler.wait_idle().await;

        let job = h.registry.get(id).unwrap();
        assert!(matches!(
            job.last_run_result,
            Some(RunResult::Failed { ref reason, .. }) if reason.contains("panicked")
        ));
        assert!(job.invocation.is_none());
    }

    #[tokio::test]
    async fn shutdown_drains_running_backups() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeExecutor::gated(&gate), 2);
        let id = h.registry.add("every minute", h.local_target()).unwrap();

        h.scheduler.start();
        h.clock.advance(TimeDelta::seconds(30));
        h.scheduler.tick();
        h.executor.wait_started(1).await;

        let scheduler = h.scheduler.clone();
        let shutdown = tokio::spawn(async move { scheduler.shutdown().await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!shutdown.is_finished());

        gate.add_permits(1);
        shutdown.await.unwrap();
        assert!(matches!(
            h.registry.get(id).unwrap().last_run_result,
            Some(RunResult::Succeeded { .. })
        ));
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = ExecutionError::io(
            "writing dump",
            std::io::Error::other("disk full"),
        );
        assert_eq!(error_chain(&err), "I/O error while writing dump: disk full");
    }
}
