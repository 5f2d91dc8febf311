//! Flush times manager
//!
//! Keeps the last known flush watermarks of one shard set and persists
//! updates in the background. Callers never wait on the store when
//! submitting; the writer merges concurrent updates by per-shard maximum so
//! a watermark in the store never moves backwards.

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::times::ShardSetFlushTimes;
use crate::error::{CoordError, Result};
use crate::lifecycle::Lifecycle;
use crate::metrics::FlushTimesMetrics;
use crate::runtime::{Backoff, BackoffConfig, ShutdownListener, ShutdownSignal};
use crate::store::KvStore;
use crate::watch::{Decoder, KeyedWatcher, Watch, WatchConfig, Watchable};

const COMPONENT: &str = "flush times manager";

/// Compare-and-swap rounds per write before giving up to the retry loop
const MAX_CAS_ATTEMPTS: usize = 8;

/// Configuration for the flush times manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlushTimesConfig {
    /// Prefix of per-shard-set keys
    pub key_prefix: String,
    /// Instance id recorded as the writer of each snapshot
    pub writer_id: String,
    /// Upper bound on the final write performed by `close`
    pub close_timeout_ms: u64,
    /// Backoff between failed writes
    pub backoff: BackoffConfig,
    /// Watch settings for the flush times key
    pub watch: WatchConfig,
}

impl Default for FlushTimesConfig {
    fn default() -> Self {
        Self {
            key_prefix: "/shardset".into(),
            writer_id: "localhost:6000".into(),
            close_timeout_ms: 5_000,
            backoff: BackoffConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl FlushTimesConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Flush times key for a shard set
    pub fn flush_times_key(&self, shard_set_id: u32) -> String {
        format!("{}/{}/flush", self.key_prefix, shard_set_id)
    }
}

/// Newest snapshot read from or written to the store
#[derive(Default)]
struct Observed {
    latest: Option<ShardSetFlushTimes>,
    /// Set by `reset`; the next `get` goes back to the store
    stale: bool,
}

/// Submitted updates not yet known to be in the store
#[derive(Default)]
struct Submissions {
    /// Greatest snapshot accepted by `store_async`
    accepted: Option<ShardSetFlushTimes>,
    /// Latest snapshot waiting for the writer
    pending: Option<ShardSetFlushTimes>,
}

struct Inner {
    config: FlushTimesConfig,
    store: Arc<dyn KvStore>,
    lifecycle: Lifecycle,
    key: OnceLock<String>,
    shard_set_id: OnceLock<u32>,
    observed: RwLock<Observed>,
    submissions: Mutex<Submissions>,
    wake: Notify,
    changes: Watchable<ShardSetFlushTimes>,
    watcher: Mutex<Option<KeyedWatcher<ShardSetFlushTimes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
    metrics: OnceLock<FlushTimesMetrics>,
}

impl Inner {
    fn key(&self) -> Result<&str> {
        self.key
            .get()
            .map(String::as_str)
            .ok_or(CoordError::NotOpen { component: COMPONENT })
    }

    fn shard_set_id(&self) -> u32 {
        self.shard_set_id.get().copied().unwrap_or_default()
    }

    /// Record a snapshot read from or written to the store
    ///
    /// The newest generation wins. Any store read also clears a pending reset.
    fn install(&self, times: ShardSetFlushTimes) {
        {
            let mut observed = self.observed.write();
            observed.stale = false;
            let known = observed.latest.as_ref().map(|l| l.generation);
            if known.is_some_and(|generation| generation >= times.generation) {
                return;
            }
            observed.latest = Some(times.clone());
        }
        debug!(
            "Shard set {} flush times advanced to generation {}",
            self.shard_set_id(),
            times.generation
        );
        let _ = self.changes.update(times);
    }

    /// Read the key and install what is there; `None` when absent
    async fn fetch(&self) -> Result<Option<ShardSetFlushTimes>> {
        let key = self.key()?;
        match self.store.get(key).await? {
            Some(value) => {
                self.install(ShardSetFlushTimes::from_versioned(&value)?);
                Ok(self.observed.read().latest.clone())
            }
            None => Ok(None),
        }
    }

    fn take_pending(&self) -> Option<ShardSetFlushTimes> {
        self.submissions.lock().pending.take()
    }

    /// Put an unwritten snapshot back, keeping anything newer
    fn restore_pending(&self, times: ShardSetFlushTimes) {
        let mut submissions = self.submissions.lock();
        submissions.pending = Some(match submissions.pending.take() {
            Some(newer) => newer.merge_max(&times),
            None => times,
        });
    }

    /// Compare-and-swap `times` into the store, re-merging on conflicts
    ///
    /// The first round is based on the newest observed snapshot, so shards
    /// advanced by other writers since `times` was built are carried along.
    async fn write(&self, times: ShardSetFlushTimes) -> Result<ShardSetFlushTimes> {
        let key = self.key()?;
        let (mut candidate, mut expected) = match self.observed.read().latest.as_ref() {
            Some(latest) => (times.merge_max(latest), latest.generation),
            None => (times, 0),
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.store.check_and_set(key, expected, candidate.to_bytes()?).await {
                Ok(version) => {
                    candidate.generation = version;
                    return Ok(candidate);
                }
                Err(CoordError::VersionMismatch { actual, .. }) => {
                    if let Some(metrics) = self.metrics.get() {
                        metrics.write_conflicts.inc();
                    }
                    debug!(
                        "Flush times conflict on {} (expected {}, found {})",
                        key, expected, actual
                    );
                    match self.store.get(key).await? {
                        Some(value) => {
                            let stored = ShardSetFlushTimes::from_versioned(&value)?;
                            candidate = candidate.merge_max(&stored);
                            expected = value.version;
                        }
                        None => expected = 0,
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(CoordError::VersionMismatch {
            key: key.to_string(),
            expected,
            actual: 0,
        })
    }

    /// Write the pending snapshot until it lands or shutdown starts
    async fn drain(&self, shutdown: &mut ShutdownListener) {
        let Some(mut times) = self.take_pending() else {
            return;
        };
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            let started = Instant::now();
            match self.write(times.clone()).await {
                Ok(written) => {
                    if let Some(metrics) = self.metrics.get() {
                        metrics.writes.inc();
                        metrics.write_latency.observe(started.elapsed());
                    }
                    debug!(
                        "Persisted flush times for shard set {} at generation {}",
                        self.shard_set_id(),
                        written.generation
                    );
                    self.install(written);
                    return;
                }
                Err(e) => {
                    if let Some(metrics) = self.metrics.get() {
                        metrics.write_errors.inc();
                    }
                    if !e.is_retryable() {
                        error!(
                            "Dropping flush times update for shard set {}: {}",
                            self.shard_set_id(),
                            e
                        );
                        return;
                    }
                    warn!(
                        "Flush times write for shard set {} failed (attempt {}): {}",
                        self.shard_set_id(),
                        backoff.attempts() + 1,
                        e
                    );
                }
            }

            if let Some(newer) = self.take_pending() {
                times = newer.merge_max(&times);
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    self.restore_pending(times);
                    return;
                }
                _ = backoff.wait() => {}
            }
        }
    }

    async fn run_writer(self: Arc<Self>, mut shutdown: ShutdownListener) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.wake.notified() => self.drain(&mut shutdown).await,
            }
        }

        if let Some(times) = self.take_pending() {
            match tokio::time::timeout(self.config.close_timeout(), self.write(times)).await {
                Ok(Ok(written)) => {
                    if let Some(metrics) = self.metrics.get() {
                        metrics.writes.inc();
                    }
                    info!(
                        "Final flush times write for shard set {} at generation {}",
                        self.shard_set_id(),
                        written.generation
                    );
                    self.install(written);
                }
                Ok(Err(e)) => {
                    if let Some(metrics) = self.metrics.get() {
                        metrics.write_errors.inc();
                    }
                    warn!("Final flush times write for shard set {} failed: {}", self.shard_set_id(), e);
                }
                Err(_) => warn!(
                    "Final flush times write for shard set {} timed out",
                    self.shard_set_id()
                ),
            }
        }
        debug!("Flush times writer for shard set {} stopped", self.shard_set_id());
    }
}

/// Tracks and persists the flush watermarks of one shard set
pub struct FlushTimesManager {
    inner: Arc<Inner>,
}

impl FlushTimesManager {
    /// Create a flush times manager; call `open` before use
    pub fn new(config: FlushTimesConfig, store: Arc<dyn KvStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                lifecycle: Lifecycle::new(COMPONENT),
                key: OnceLock::new(),
                shard_set_id: OnceLock::new(),
                observed: RwLock::new(Observed::default()),
                submissions: Mutex::new(Submissions::default()),
                wake: Notify::new(),
                changes: Watchable::new(),
                watcher: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                shutdown: ShutdownSignal::new(),
                metrics: OnceLock::new(),
            }),
        }
    }

    /// Start tracking the flush times of `shard_set_id`
    ///
    /// Reads the current snapshot before returning so that `store_async`
    /// always validates against what the store holds.
    pub async fn open(&self, shard_set_id: u32) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.begin_open()?;
        let key = inner.config.flush_times_key(shard_set_id);
        let _ = inner.shard_set_id.set(shard_set_id);
        let _ = inner.key.set(key.clone());
        let _ = inner.metrics.set(FlushTimesMetrics::new(shard_set_id));

        match inner.fetch().await {
            Ok(Some(times)) => debug!("Shard set {} starts at generation {}", shard_set_id, times.generation),
            Ok(None) => info!("No flush times stored at {} yet", key),
            Err(e) => {
                inner.lifecycle.abort_open();
                return Err(e);
            }
        }

        let decoder: Decoder<ShardSetFlushTimes> = Arc::new(ShardSetFlushTimes::from_versioned);
        let watcher = KeyedWatcher::new(inner.store.clone(), decoder, inner.config.watch.clone());
        let mut watch = match watcher.watch(&key) {
            Ok(w) => w,
            Err(e) => {
                inner.lifecycle.abort_open();
                return Err(e);
            }
        };
        *inner.watcher.lock() = Some(watcher);

        let watch_inner = inner.clone();
        let mut shutdown = inner.shutdown.subscribe();
        let watch_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    update = watch.next() => match update {
                        Some(versioned) => {
                            if let Some(times) = versioned.value {
                                watch_inner.install(times);
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        let writer_task = tokio::spawn(inner.clone().run_writer(inner.shutdown.subscribe()));
        inner.tasks.lock().extend([watch_task, writer_task]);

        inner.lifecycle.finish_open();
        info!("Flush times manager opened for shard set {} on {}", shard_set_id, key);
        Ok(())
    }

    /// Last known flush times, read from the store when nothing is cached
    pub async fn get(&self) -> Result<ShardSetFlushTimes> {
        let inner = &self.inner;
        inner.lifecycle.check_open()?;
        {
            let observed = inner.observed.read();
            if let (false, Some(times)) = (observed.stale, observed.latest.as_ref()) {
                return Ok(times.clone());
            }
        }
        inner.fetch().await?.ok_or(CoordError::NoFlushTimes {
            shard_set_id: inner.shard_set_id(),
        })
    }

    /// Queue `times` for persistence
    ///
    /// Shards not mentioned keep their last known watermark. Returns
    /// `NonMonotonicUpdate` without queueing anything if any shard would move
    /// backwards relative to what was observed or already submitted. A
    /// `reset` does not lower this baseline.
    pub fn store_async(&self, times: ShardSetFlushTimes) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.check_open()?;

        let mut submissions = inner.submissions.lock();
        let observed = inner.observed.read().latest.clone().unwrap_or_default();
        let known = match submissions.accepted.as_ref() {
            Some(accepted) => observed.merge_max(accepted),
            None => observed,
        };

        if let Err(e) = times.check_monotonic(&known) {
            if let Some(metrics) = inner.metrics.get() {
                metrics.rejected_updates.inc();
            }
            warn!("Rejected flush times for shard set {}: {}", inner.shard_set_id(), e);
            return Err(e);
        }

        let mut update = times;
        update.writer = inner.config.writer_id.clone();
        let merged = update.overlay(&known);
        submissions.accepted = Some(merged.clone());
        submissions.pending = Some(match submissions.pending.take() {
            Some(queued) => merged.merge_max(&queued),
            None => merged,
        });
        drop(submissions);

        inner.wake.notify_one();
        Ok(())
    }

    /// Subscribe to flush times changes
    pub fn watch(&self) -> Result<Watch<ShardSetFlushTimes>> {
        self.inner.lifecycle.check_open()?;
        self.inner.changes.watch()
    }

    /// Invalidate the cached snapshot; the next `get` reads from the store
    pub fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.check_open()?;
        inner.observed.write().stale = true;
        info!("Flush times manager for shard set {} reset", inner.shard_set_id());
        Ok(())
    }

    /// Stop background work after a best-effort write of pending updates
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.close()?;
        inner.shutdown.shutdown();
        if let Some(watcher) = inner.watcher.lock().take() {
            watcher.close();
        }

        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Flush times task for shard set {} panicked: {}", inner.shard_set_id(), e);
            }
        }
        inner.changes.close();
        info!("Flush times manager for shard set {} closed", inner.shard_set_id());
        Ok(())
    }

    /// Shard set being tracked, once opened
    pub fn shard_set_id(&self) -> Option<u32> {
        self.inner.shard_set_id.get().copied()
    }

    pub fn metrics(&self) -> Option<&FlushTimesMetrics> {
        self.inner.metrics.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn test_flush_times_key() {
        let config = FlushTimesConfig::default();
        assert_eq!(config.flush_times_key(3), "/shardset/3/flush");
        assert_eq!(config.close_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let mgr = FlushTimesManager::new(FlushTimesConfig::default(), Arc::new(MemStore::new()));
        assert_eq!(mgr.get().await.unwrap_err(), CoordError::NotOpen { component: COMPONENT });
        assert!(mgr.store_async(ShardSetFlushTimes::new()).is_err());

        mgr.open(1).await.unwrap();
        assert_eq!(mgr.open(1).await.unwrap_err(), CoordError::AlreadyOpen { component: COMPONENT });
        assert_eq!(mgr.get().await.unwrap_err(), CoordError::NoFlushTimes { shard_set_id: 1 });

        mgr.close().await.unwrap();
        assert_eq!(mgr.close().await.unwrap_err(), CoordError::AlreadyClosed { component: COMPONENT });
        assert!(mgr.reset().is_err());
    }

    #[tokio::test]
    async fn test_get_without_cache_surfaces_store_errors() {
        let store = Arc::new(MemStore::new());
        let mgr = FlushTimesManager::new(FlushTimesConfig::default(), store.clone());
        mgr.open(2).await.unwrap();

        store.set_available(false);
        mgr.reset().unwrap();
        assert!(matches!(mgr.get().await, Err(CoordError::StoreUnavailable { .. })));

        store.set_available(true);
        mgr.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_writes_pending_update() {
        let store = Arc::new(MemStore::new());
        let config = FlushTimesConfig {
            writer_id: "i1".into(),
            ..Default::default()
        };
        let key = config.flush_times_key(5);
        let mgr = FlushTimesManager::new(config, store.clone());
        mgr.open(5).await.unwrap();

        mgr.store_async(ShardSetFlushTimes::new().with_shard(0, 500)).unwrap();
        mgr.close().await.unwrap();

        let value = store.get(&key).await.unwrap().unwrap();
        let stored = ShardSetFlushTimes::from_versioned(&value).unwrap();
        assert_eq!(stored.watermark(0), Some(500));
        assert_eq!(stored.writer, "i1");
    }
}
