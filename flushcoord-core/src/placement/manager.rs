//! Placement manager
//!
//! Caches the staged placement stored under a single key, resolves the
//! active placement with the manager's clock, and answers ownership
//! questions for the local instance.

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::staged::{ActiveStagedPlacement, StagedPlacement};
use super::types::{Instance, Placement, Shards};
use crate::clock::Clock;
use crate::error::{CoordError, Result};
use crate::lifecycle::Lifecycle;
use crate::metrics::PlacementMetrics;
use crate::runtime::ShutdownSignal;
use crate::store::{KvStore, VersionedValue};
use crate::watch::{Decoder, KeyedWatcher, Watch, WatchConfig, Watchable};

const COMPONENT: &str = "placement manager";

/// Configuration for the placement manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Identifier of this process within the placement
    pub instance_id: String,
    /// Store key holding the staged placement
    pub placement_key: String,
    /// Watch settings for the placement key
    pub watch: WatchConfig,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            instance_id: "localhost:6000".into(),
            placement_key: "/placement/aggregator".into(),
            watch: WatchConfig::default(),
        }
    }
}

struct Inner {
    config: PlacementConfig,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    lifecycle: Lifecycle,
    current: RwLock<Option<Arc<ActiveStagedPlacement>>>,
    changes: Watchable<Arc<ActiveStagedPlacement>>,
    watcher: Mutex<Option<Arc<KeyedWatcher<Arc<ActiveStagedPlacement>>>>>,
    shutdown: ShutdownSignal,
    metrics: Arc<PlacementMetrics>,
}

impl Inner {
    /// Swap in a newer snapshot and notify watchers
    fn install(&self, active: Arc<ActiveStagedPlacement>) {
        {
            let mut current = self.current.write();
            if let Some(existing) = current.as_ref() {
                if existing.store_version() > active.store_version() {
                    return;
                }
            }
            *current = Some(active.clone());
        }

        self.metrics.updates.inc();
        if let Ok(p) = active.active_placement_at(self.clock.now_nanos()) {
            self.metrics.placement_version.set(p.version as i64);
        }
        debug!(
            "Installed placement with {} stage(s) at store version {}",
            active.placements().len(),
            active.store_version()
        );
        let _ = self.changes.update(active);
    }

    /// Read the placement key straight from the store
    async fn fetch(&self) -> Result<Option<Arc<ActiveStagedPlacement>>> {
        match self.store.get(&self.config.placement_key).await? {
            Some(value) => match decode(&value) {
                Ok(active) => Ok(Some(active)),
                Err(e) => {
                    self.metrics.decode_errors.inc();
                    warn!(
                        "Ignoring invalid placement at {} (version {}): {}",
                        self.config.placement_key, value.version, e
                    );
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn snapshot(&self) -> Result<Arc<ActiveStagedPlacement>> {
        self.lifecycle.check_open()?;
        self.current.read().clone().ok_or(CoordError::NoPlacement)
    }
}

fn decode(value: &VersionedValue) -> Result<Arc<ActiveStagedPlacement>> {
    let staged = StagedPlacement::from_bytes(&value.data)?;
    Ok(Arc::new(ActiveStagedPlacement::new(staged, value.version)?))
}

/// Tracks the cluster placement and this instance's place in it
pub struct PlacementManager {
    inner: Arc<Inner>,
}

impl PlacementManager {
    /// Create a placement manager; call `open` before use
    pub fn new(config: PlacementConfig, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                clock,
                lifecycle: Lifecycle::new(COMPONENT),
                current: RwLock::new(None),
                changes: Watchable::new(),
                watcher: Mutex::new(None),
                shutdown: ShutdownSignal::new(),
                metrics: Arc::new(PlacementMetrics::new()),
            }),
        }
    }

    /// Read the placement and start watching it
    ///
    /// Fails when the store cannot be reached; an absent placement key is
    /// not an error.
    pub async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.begin_open()?;

        match inner.fetch().await {
            Ok(Some(active)) => inner.install(active),
            Ok(None) => info!("No placement stored at {} yet", inner.config.placement_key),
            Err(e) => {
                inner.lifecycle.abort_open();
                return Err(e);
            }
        }

        let metrics = inner.metrics.clone();
        let decoder: Decoder<Arc<ActiveStagedPlacement>> = Arc::new(move |value: &VersionedValue| {
            decode(value).inspect_err(|_| metrics.decode_errors.inc())
        });
        let watcher = Arc::new(KeyedWatcher::new(
            inner.store.clone(),
            decoder,
            inner.config.watch.clone(),
        ));
        let mut watch = match watcher.watch(&inner.config.placement_key) {
            Ok(w) => w,
            Err(e) => {
                inner.lifecycle.abort_open();
                return Err(e);
            }
        };
        *inner.watcher.lock() = Some(watcher);

        let task_inner = inner.clone();
        let mut shutdown = inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    update = watch.next() => match update {
                        Some(versioned) => match versioned.value {
                            Some(active) => task_inner.install(active),
                            None => warn!(
                                "Placement key {} deleted, keeping last known placement",
                                task_inner.config.placement_key
                            ),
                        },
                        None => break,
                    },
                }
            }
            debug!("Placement watch loop stopped");
        });

        inner.lifecycle.finish_open();
        info!(
            "Placement manager opened for instance {} on {}",
            inner.config.instance_id, inner.config.placement_key
        );
        Ok(())
    }

    /// Identifier of the local instance
    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    /// The staged placement holder and the placement active now
    pub fn placement(&self) -> Result<(Arc<ActiveStagedPlacement>, Placement)> {
        let active = self.inner.snapshot()?;
        let placement = active
            .active_placement_at(self.inner.clock.now_nanos())?
            .clone();
        Ok((active, placement))
    }

    /// Local instance under the active placement
    pub fn instance(&self) -> Result<Instance> {
        let (_, placement) = self.placement()?;
        self.instance_from(&placement)
    }

    /// Local instance under an arbitrary placement, e.g. a staged one
    pub fn instance_from(&self, placement: &Placement) -> Result<Instance> {
        placement
            .instance(&self.inner.config.instance_id)
            .cloned()
            .ok_or_else(|| CoordError::InstanceNotFound {
                instance_id: self.inner.config.instance_id.clone(),
            })
    }

    /// Shards owned by the local instance under the active placement
    pub fn shards(&self) -> Result<Shards> {
        Ok(self.instance()?.shards)
    }

    /// Whether another instance is configured to take over the local one
    pub fn has_replacement_instance(&self) -> Result<bool> {
        let (_, placement) = self.placement()?;
        Ok(placement.has_replacement_for(&self.inner.config.instance_id))
    }

    /// Subscribe to placement changes
    pub fn watch(&self) -> Result<Watch<Arc<ActiveStagedPlacement>>> {
        self.inner.lifecycle.check_open()?;
        self.inner.changes.watch()
    }

    /// Drop the cached placement and re-read it from the store
    pub async fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.check_open()?;
        *inner.current.write() = None;
        if let Some(active) = inner.fetch().await? {
            inner.install(active);
        }
        info!("Placement manager reset");
        Ok(())
    }

    /// Stop watching the placement
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.close()?;
        inner.shutdown.shutdown();
        if let Some(watcher) = inner.watcher.lock().take() {
            watcher.close();
        }
        inner.changes.close();
        info!("Placement manager closed");
        Ok(())
    }

    pub fn metrics(&self) -> &PlacementMetrics {
        &self.inner.metrics
    }
}
