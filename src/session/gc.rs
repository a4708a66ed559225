//! Garbage collector for expired cluster sessions.
//!
//! The collector periodically lists every session object in the partition and
//! deletes the ones whose embedded expiry has passed. It talks to the remote
//! store only; local caches age out on their own TTL.
//!
//! The first cycle runs inside [`GarbageCollector::start`], so a store that
//! cannot even be listed fails process startup. After that, cycle failures are
//! logged, reported on the handle's error channel and retried next interval.
//! [`GarbageCollector::start_supervised`] adds a supervisor that drains that
//! channel and restarts the collector if its task dies.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::{StreamExt, stream};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{KeyValueStore, codec, token_hint};
use crate::observability::metrics;

/// Queued cycle errors not yet read by the supervisor. New errors are
/// dropped while the channel is full.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Deletes in flight at once within a cycle.
const DELETE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GcError {
    #[error("failed to list session objects: {0}")]
    List(String),
}

/// Results from a single collection cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcCycleReport {
    /// Objects listed.
    pub scanned: usize,
    /// Expired objects deleted.
    pub deleted: usize,
    /// Expired objects whose deletion failed; retried next cycle.
    pub failed: usize,
    /// Objects that could not be decoded. Left in place.
    pub malformed: usize,
    pub duration_ms: u64,
}

impl GcCycleReport {
    pub fn has_activity(&self) -> bool {
        self.deleted > 0 || self.failed > 0 || self.malformed > 0
    }
}

#[derive(Clone)]
pub struct GarbageCollector {
    remote: Arc<dyn KeyValueStore>,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(remote: Arc<dyn KeyValueStore>, interval: Duration) -> Self {
        Self {
            remote,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    /// Run one cycle. Only a failure to list is an error; per-object failures
    /// are counted in the report.
    pub async fn run_cycle(&self) -> Result<GcCycleReport, GcError> {
        let start = Instant::now();
        let now = Utc::now();
        let mut report = GcCycleReport::default();

        let objects = self
            .remote
            .list()
            .await
            .map_err(|e| GcError::List(e.to_string()))?;
        report.scanned = objects.len();

        let mut expired = Vec::new();
        for (key, bytes) in objects {
            match codec::decode_ignoring_expiry(&bytes) {
                Ok(record) if record.is_expired_at(now) => expired.push(key),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        token = token_hint(&key),
                        error = %e,
                        "Skipping undecodable session object"
                    );
                    report.malformed += 1;
                }
            }
        }

        let deletions: Vec<_> = stream::iter(expired)
            .map(|key| async move {
                let result = self.remote.delete(&key).await;
                (key, result)
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .collect()
            .await;

        for (key, result) in deletions {
            match result {
                // Already gone (logout or another replica's collector) counts as done.
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    tracing::warn!(
                        token = token_hint(&key),
                        error = %e,
                        "Failed to delete expired session, will retry next cycle"
                    );
                    report.failed += 1;
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        metrics::record_gc_cycle(
            report.scanned,
            report.deleted,
            report.failed,
            report.malformed,
        );
        Ok(report)
    }

    /// Run the first cycle, then keep collecting in a background task.
    pub async fn start(self) -> Result<GcHandle, GcError> {
        let first = self.run_cycle().await.inspect_err(|e| {
            metrics::record_gc_error();
            tracing::error!(
                partition = self.remote.partition(),
                error = %e,
                "Session garbage collector failed its first cycle"
            );
        })?;

        tracing::info!(
            partition = self.remote.partition(),
            interval_secs = self.interval.as_secs(),
            scanned = first.scanned,
            deleted = first.deleted,
            "Started session garbage collector"
        );

        Ok(self.spawn())
    }

    /// [`start`](Self::start), then watch the collector until stopped. Cycle
    /// errors are drained and counted; a collector task that ends on its own
    /// is restarted.
    pub async fn start_supervised(self) -> Result<SupervisedGc, GcError> {
        let handle = self.clone().start().await?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervise(self, handle, shutdown.clone()));
        Ok(SupervisedGc { shutdown, task })
    }

    fn spawn(self) -> GcHandle {
        let cancel = CancellationToken::new();
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(cancel.clone(), errors_tx));

        GcHandle {
            cancel,
            task,
            errors: errors_rx,
        }
    }

    async fn run(self, cancel: CancellationToken, errors: mpsc::Sender<GcError>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the first cycle already ran.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(report) if report.has_activity() => {
                    tracing::info!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        failed = report.failed,
                        malformed = report.malformed,
                        duration_ms = report.duration_ms,
                        "Session garbage collection complete"
                    );
                }
                Ok(report) => {
                    tracing::debug!(
                        scanned = report.scanned,
                        "Session garbage collection complete, nothing expired"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Session garbage collection failed");
                    metrics::record_gc_error();
                    let _ = errors.try_send(e);
                }
            }
        }

        tracing::info!("Session garbage collector stopped");
    }
}

/// Supervision handle for a running collector.
pub struct GcHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    errors: mpsc::Receiver<GcError>,
}

impl GcHandle {
    /// Stop the collector and wait for an in-flight cycle to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Session garbage collector task panicked");
        }
    }
}

async fn supervise(
    collector: GarbageCollector,
    mut handle: GcHandle,
    shutdown: CancellationToken,
) {
    let mut failed_cycles: u64 = 0;
    let mut restarts: u64 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = handle.errors.recv() => event,
        };

        match event {
            Some(e) => {
                failed_cycles += 1;
                tracing::warn!(
                    error = %e,
                    failed_cycles,
                    "Session garbage collector reported a failed cycle"
                );
            }
            // Every sender is gone, so the task ended without a stop.
            None => {
                restarts += 1;
                metrics::record_gc_error();
                tracing::error!(restarts, "Session garbage collector exited, restarting");
                let dead = std::mem::replace(&mut handle, collector.clone().spawn());
                dead.stop().await;
            }
        }
    }

    handle.stop().await;
}

/// A collector plus the task watching it.
pub struct SupervisedGc {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisedGc {
    /// Stop the supervisor and the collector it is watching.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Session garbage collector supervisor panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashSet},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::session::{IdentityRecord, KvError, MemoryKeyValueStore};

    /// Memory store that can refuse to list or to delete specific keys.
    #[derive(Default)]
    struct FlakyRemote {
        inner: MemoryKeyValueStore,
        list_down: AtomicBool,
        undeletable: HashSet<String>,
        lists: AtomicUsize,
        /// Panic on this list call (1-based), simulating a crashed task.
        panic_on_list: Option<usize>,
    }

    #[async_trait]
    impl KeyValueStore for FlakyRemote {
        fn partition(&self) -> &str {
            "test"
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, KvError> {
            if self.undeletable.contains(key) {
                return Err(KvError::Unavailable("etcd leader lost".into()));
            }
            self.inner.delete(key).await
        }

        async fn list(&self) -> Result<Vec<(String, Vec<u8>)>, KvError> {
            let call = self.lists.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on_list == Some(call) {
                panic!("list call {call} crashed");
            }
            if self.list_down.load(Ordering::SeqCst) {
                return Err(KvError::Unavailable("forbidden".into()));
            }
            self.inner.list().await
        }
    }

    fn encoded(expires_in: chrono::Duration) -> Vec<u8> {
        let expires_at = Utc::now() + expires_in;
        let record = IdentityRecord {
            subject: "someone".into(),
            claims: BTreeMap::new(),
            groups: vec![],
            issued_at: expires_at - chrono::Duration::hours(12),
            expires_at,
            id_token: None,
        };
        codec::encode(&record).unwrap()
    }

    async fn seed(remote: &FlakyRemote, live: usize, expired: usize) {
        for i in 0..live {
            remote
                .put(&format!("live-{i:02}"), encoded(chrono::Duration::hours(1)))
                .await
                .unwrap();
        }
        for i in 0..expired {
            remote
                .put(&format!("expired-{i:02}"), encoded(-chrono::Duration::minutes(1)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cycle_deletes_exactly_the_expired_objects() {
        let remote = Arc::new(FlakyRemote::default());
        seed(&remote, 7, 5).await;

        let gc = GarbageCollector::new(remote.clone(), Duration::from_secs(60));
        let report = gc.run_cycle().await.unwrap();

        assert_eq!(report.scanned, 12);
        assert_eq!(report.deleted, 5);
        assert_eq!(report.failed, 0);

        let remaining: Vec<_> = remote
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(remaining.len(), 7);
        assert!(remaining.iter().all(|k| k.starts_with("live-")));
    }

    #[tokio::test]
    async fn test_delete_failure_is_skipped() {
        let remote = Arc::new(FlakyRemote {
            undeletable: HashSet::from(["expired-01".to_string()]),
            ..Default::default()
        });
        seed(&remote, 2, 3).await;

        let gc = GarbageCollector::new(remote.clone(), Duration::from_secs(60));
        let report = gc.run_cycle().await.unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 1);
        assert!(remote.inner.contains("expired-01").await);
        assert!(!remote.inner.contains("expired-00").await);
        assert!(!remote.inner.contains("expired-02").await);
    }

    #[tokio::test]
    async fn test_malformed_objects_are_left_alone() {
        let remote = Arc::new(FlakyRemote::default());
        seed(&remote, 1, 1).await;
        remote.put("junk", b"\x07garbage".to_vec()).await.unwrap();

        let gc = GarbageCollector::new(remote.clone(), Duration::from_secs(60));
        let report = gc.run_cycle().await.unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(report.deleted, 1);
        assert!(remote.inner.contains("junk").await);
    }

    #[tokio::test]
    async fn test_start_fails_when_store_cannot_be_listed() {
        let remote = Arc::new(FlakyRemote::default());
        remote.list_down.store(true, Ordering::SeqCst);

        let gc = GarbageCollector::new(remote, Duration::from_secs(60));
        assert!(matches!(gc.start().await, Err(GcError::List(_))));
    }

    #[tokio::test]
    async fn test_start_collects_then_stops() {
        let remote = Arc::new(FlakyRemote::default());
        seed(&remote, 1, 2).await;

        let gc = GarbageCollector::new(remote.clone(), Duration::from_secs(60));
        let handle = gc.start().await.unwrap();

        // The first cycle runs before start returns.
        assert_eq!(remote.inner.len().await, 1);
        assert!(!handle.task.is_finished());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_errors_are_reported_on_the_handle() {
        let remote = Arc::new(FlakyRemote::default());
        let gc = GarbageCollector::new(remote.clone(), Duration::from_secs(60));
        let mut handle = gc.start().await.unwrap();

        remote.list_down.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(61)).await;

        let err = handle.errors.recv().await.unwrap();
        assert!(matches!(err, GcError::List(_)));
        assert!(!handle.task.is_finished(), "cycle errors are never fatal");

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_restarts_a_crashed_collector() {
        let remote = Arc::new(FlakyRemote {
            panic_on_list: Some(2),
            ..Default::default()
        });
        let gc = GarbageCollector::new(remote.clone(), Duration::from_secs(60));
        let supervised = gc.start_supervised().await.unwrap();

        // Call 2 panics inside the collector task; the replacement makes call 3.
        for _ in 0..10 {
            if remote.lists.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        assert!(remote.lists.load(Ordering::SeqCst) >= 3);

        supervised.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_survives_repeated_cycle_errors() {
        let remote = Arc::new(FlakyRemote::default());
        let gc = GarbageCollector::new(remote.clone(), Duration::from_secs(60));
        let supervised = gc.start_supervised().await.unwrap();

        remote.list_down.store(true, Ordering::SeqCst);
        // More failed cycles than the error channel holds.
        tokio::time::sleep(Duration::from_secs(60 * (ERROR_CHANNEL_CAPACITY as u64 + 4))).await;
        assert!(remote.lists.load(Ordering::SeqCst) > ERROR_CHANNEL_CAPACITY + 1);

        supervised.stop().await;
    }
}
