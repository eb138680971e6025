use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backupd_pipeline::BackupPipeline;
use backupd_scheduler::{InvocationDescriptor, InvocationScheduler, ProfileRegistry};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Drives the registry → scheduler → pipeline loop.
pub struct Worker {
    registry: Arc<ProfileRegistry>,
    scheduler: InvocationScheduler,
    pipeline: Arc<BackupPipeline>,
    tick_interval: Duration,
    /// Running backups keyed by profile id.
    in_flight: HashMap<String, JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        registry: Arc<ProfileRegistry>,
        pipeline: Arc<BackupPipeline>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            registry,
            scheduler: InvocationScheduler::new(),
            pipeline,
            tick_interval,
            in_flight: HashMap::new(),
        }
    }

    /// Queue every active profile's next occurrence and return what is due.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<InvocationDescriptor> {
        for invocation in self.registry.get_invocations(now) {
            self.scheduler.schedule(invocation);
        }
        self.scheduler.drain_due(now)
    }

    /// Start a backup for `invocation` unless its profile is still running.
    /// Returns whether a task was spawned.
    pub fn dispatch(&mut self, invocation: InvocationDescriptor) -> bool {
        self.in_flight.retain(|_, handle| !handle.is_finished());
        if self.in_flight.contains_key(&invocation.profile_id) {
            warn!(
                profile_id = %invocation.profile_id,
                invoke_at = %invocation.invoke_at,
                "previous run still in progress, skipping occurrence"
            );
            return false;
        }

        let profile_id = invocation.profile_id.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let handle = tokio::spawn(async move {
            debug!(profile_id = %invocation.profile_id, invoke_at = %invocation.invoke_at, "backup started");
            match pipeline.run(&invocation).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {
                    info!(profile_id = %invocation.profile_id, "backup cancelled");
                }
                Err(e) => {
                    error!(profile_id = %invocation.profile_id, error = %e, "backup failed");
                }
            }
        });
        self.in_flight.insert(profile_id, handle);
        true
    }

    /// Number of backups still running.
    pub fn running(&mut self) -> usize {
        self.in_flight.retain(|_, handle| !handle.is_finished());
        self.in_flight.len()
    }

    /// Tick until `shutdown` flips to true, then revoke every profile and
    /// wait for running backups to wind down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.tick_interval.as_millis() as u64, "worker started");

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for invocation in self.tick(Utc::now()) {
                        self.dispatch(invocation);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("worker shutting down");
                        break;
                    }
                }
            }
        }

        self.registry.shutdown();
        for (profile_id, handle) in self.in_flight.drain() {
            if let Err(e) = handle.await {
                error!(profile_id = %profile_id, error = %e, "backup task panicked");
            }
        }
        info!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backupd_core::config::{ProfileConfig, SearchDefinitionConfig};
    use backupd_pipeline::{ArchiveSink, PipelineError};
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Records each write and then holds it open until cancelled.
    #[derive(Default)]
    struct BlockingSink {
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArchiveSink for BlockingSink {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn write(
            &self,
            name: &str,
            _archive: &Path,
            cancel: &CancellationToken,
        ) -> backupd_pipeline::Result<()> {
            self.writes.lock().unwrap().push(name.to_string());
            cancel.cancelled().await;
            Err(PipelineError::Cancelled)
        }
    }

    fn record(name: &str, cron: &str, directory: &Path) -> ProfileConfig {
        ProfileConfig {
            name: name.to_string(),
            cron: cron.to_string(),
            time_zone: None,
            search_definition: SearchDefinitionConfig {
                directory: directory.display().to_string(),
                ..Default::default()
            },
        }
    }

    fn worker(sink: Arc<BlockingSink>) -> (Worker, Arc<ProfileRegistry>) {
        let registry = Arc::new(ProfileRegistry::new(chrono_tz::UTC));
        let pipeline = Arc::new(BackupPipeline::new(sink, 1));
        let worker = Worker::new(Arc::clone(&registry), pipeline, Duration::from_millis(10));
        (worker, registry)
    }

    #[test]
    fn tick_queues_then_releases_on_time() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, registry) = worker(Arc::default());
        registry.apply_configuration(&[record("hourly", "0 * * * *", dir.path())]);

        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 0).unwrap();
        assert!(worker.tick(t0).is_empty());

        let due = worker.tick(Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].profile_id, "hourly");
        assert_eq!(due[0].invoke_at, Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap());
    }

    #[test]
    fn repeated_ticks_deliver_each_occurrence_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, registry) = worker(Arc::default());
        registry.apply_configuration(&[record("hourly", "0 * * * *", dir.path())]);

        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 0).unwrap();
        for _ in 0..5 {
            worker.tick(t0);
        }
        let later = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 30).unwrap();
        assert_eq!(worker.tick(later).len(), 1);
        assert!(worker.tick(later).is_empty());
    }

    #[test]
    fn removed_profile_is_not_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, registry) = worker(Arc::default());
        registry.apply_configuration(&[record("hourly", "0 * * * *", dir.path())]);
        worker.tick(Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 0).unwrap());

        registry.apply_configuration(&[]);
        assert!(worker
            .tick(Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap())
            .is_empty());
    }

    #[tokio::test]
    async fn overlapping_run_of_same_profile_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BlockingSink::default());
        let (mut worker, registry) = worker(Arc::clone(&sink));
        registry.apply_configuration(&[record("p", "* * * * *", dir.path())]);

        let now = Utc::now();
        let mut invocations = registry.get_invocations(now);
        let first = invocations.remove(0);
        let mut second = first.clone();
        second.invoke_at = first.invoke_at + chrono::Duration::minutes(1);

        assert!(worker.dispatch(first));
        assert!(!worker.dispatch(second));
        assert_eq!(worker.running(), 1);

        registry.shutdown();
        for (_, handle) in worker.in_flight.drain() {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn run_dispatches_and_cancels_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), "data").unwrap();
        let sink = Arc::new(BlockingSink::default());
        let (worker, registry) = worker(Arc::clone(&sink));
        // Every second, so the run below sees at least one occurrence.
        registry.apply_configuration(&[record("docs", "* * * * * *", dir.path())]);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sink.writes.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no backup was dispatched");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker did not stop")
            .unwrap();

        assert!(registry.is_shut_down());
        // The first run never finished, so later occurrences were skipped.
        assert_eq!(*sink.writes.lock().unwrap(), vec!["docs.tar.gz".to_string()]);
    }
}
