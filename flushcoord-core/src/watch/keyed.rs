//! Keyed fan-out over store subscriptions
//!
//! One upstream [`KvStore::watch`] per distinct key feeds a [`Watchable`];
//! every caller gets its own [`Watch`] on it.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::watchable::{Watch, Watchable, DEFAULT_QUEUE_CAPACITY};
use crate::error::{CoordError, Result};
use crate::metrics::WatchMetrics;
use crate::runtime::{Backoff, BackoffConfig, ShutdownListener, ShutdownSignal};
use crate::store::{KvStore, VersionedValue};

const COMPONENT: &str = "keyed watcher";

/// Configuration for keyed watchers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Per-subscriber queue capacity
    pub queue_capacity: usize,
    /// Reconnect backoff for broken upstream subscriptions
    pub backoff: BackoffConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Turns a stored payload into a typed value
pub type Decoder<T> = Arc<dyn Fn(&VersionedValue) -> Result<T> + Send + Sync>;

/// Fans one upstream subscription per key out to many watchers
///
/// Watched values are `Option<T>`: `None` when the key is absent.
pub struct KeyedWatcher<T> {
    store: Arc<dyn KvStore>,
    decode: Decoder<T>,
    config: WatchConfig,
    keys: Mutex<HashMap<String, Watchable<Option<T>>>>,
    shutdown: ShutdownSignal,
    metrics: Arc<WatchMetrics>,
}

impl<T: Clone + Send + Sync + 'static> KeyedWatcher<T> {
    /// Create a watcher decoding values with `decode`
    pub fn new(store: Arc<dyn KvStore>, decode: Decoder<T>, config: WatchConfig) -> Self {
        Self {
            store,
            decode,
            config,
            keys: Mutex::new(HashMap::new()),
            shutdown: ShutdownSignal::new(),
            metrics: Arc::new(WatchMetrics::new()),
        }
    }

    /// Subscribe to `key`, starting its upstream subscription on first use
    pub fn watch(&self, key: &str) -> Result<Watch<Option<T>>> {
        if self.shutdown.is_shutdown() {
            return Err(CoordError::AlreadyClosed { component: COMPONENT });
        }

        let mut keys = self.keys.lock();
        if let Some(watchable) = keys.get(key) {
            return watchable.watch();
        }

        let watchable = Watchable::with_capacity(self.config.queue_capacity);
        let handle = watchable.watch()?;
        keys.insert(key.to_string(), watchable.clone());
        drop(keys);

        debug!("Starting upstream watch for {}", key);
        let upstream = Upstream {
            store: self.store.clone(),
            key: key.to_string(),
            decode: self.decode.clone(),
            watchable,
            backoff: Backoff::new(self.config.backoff.clone()),
            metrics: self.metrics.clone(),
            last: None,
        };
        tokio::spawn(upstream.run(self.shutdown.subscribe()));

        Ok(handle)
    }

    /// Number of keys with an upstream subscription
    pub fn upstream_count(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn metrics(&self) -> &WatchMetrics {
        &self.metrics
    }

    /// Stop every upstream subscription and close all watches
    pub fn close(&self) {
        self.shutdown.shutdown();
        for (_, watchable) in self.keys.lock().drain() {
            watchable.close();
        }
    }
}

impl<T> Drop for KeyedWatcher<T> {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

struct Upstream<T> {
    store: Arc<dyn KvStore>,
    key: String,
    decode: Decoder<T>,
    watchable: Watchable<Option<T>>,
    backoff: Backoff,
    metrics: Arc<WatchMetrics>,
    /// Store version of the last published value (`Some(None)` = absent)
    last: Option<Option<u64>>,
}

impl<T: Clone + Send + Sync + 'static> Upstream<T> {
    async fn run(mut self, mut shutdown: ShutdownListener) {
        loop {
            if shutdown.is_shutdown() {
                break;
            }

            match self.connect().await {
                Ok(mut sub) => {
                    self.backoff.reset();
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            event = sub.recv() => match event {
                                Ok(value) => self.publish(value),
                                Err(e) => {
                                    warn!("Upstream watch for {} broke: {}", self.key, e);
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to watch {} (attempt {}): {}",
                        self.key,
                        self.backoff.attempts() + 1,
                        e
                    );
                }
            }

            self.metrics.reconnects.inc();
            let delay = self.backoff.next_delay();
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Upstream watch for {} stopped", self.key);
    }

    /// Subscribe, then replay the freshly read value
    async fn connect(&mut self) -> Result<crate::store::KeyWatch> {
        let sub = self.store.watch(&self.key).await?;
        self.metrics.upstream_watches.inc();
        let initial = self.store.get(&self.key).await?;
        if self.last.is_some() {
            info!("Reconnected upstream watch for {}", self.key);
        }
        self.publish(initial);
        Ok(sub)
    }

    fn publish(&mut self, value: Option<VersionedValue>) {
        match value {
            Some(v) => {
                if let Some(Some(last)) = self.last {
                    if v.version <= last {
                        return;
                    }
                }
                match (self.decode)(&v) {
                    Ok(decoded) => {
                        self.last = Some(Some(v.version));
                        let _ = self.watchable.update(Some(decoded));
                    }
                    Err(e) => {
                        self.metrics.decode_errors.inc();
                        warn!("Dropping undecodable value for {} at version {}: {}", self.key, v.version, e);
                    }
                }
            }
            None => {
                if self.last == Some(None) {
                    return;
                }
                self.last = Some(None);
                let _ = self.watchable.update(None);
            }
        }
    }
}
