//! Election manager
//!
//! Runs a background campaign for one shard set. The campaign holds a
//! store lease and contends for a lock key bound to it; whoever owns the
//! key is leader. Losing the lease (expiry, revocation, store outage
//! longer than the TTL) demotes the local instance without any local call.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::state::ElectionState;
use crate::error::{CoordError, Result};
use crate::lifecycle::Lifecycle;
use crate::metrics::ElectionMetrics;
use crate::placement::{ActiveStagedPlacement, PlacementManager};
use crate::runtime::{Backoff, BackoffConfig, ShutdownListener, ShutdownSignal};
use crate::store::{KeyWatch, KvStore, LeaseId};
use crate::watch::{Watch, Watchable};

const COMPONENT: &str = "election manager";

/// Configuration for shard set elections
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Prefix of per-shard-set keys
    pub key_prefix: String,
    /// Lease time-to-live
    pub lease_ttl_ms: u64,
    /// Interval between lease renewals; 0 means a third of the TTL
    pub renew_interval_ms: u64,
    /// How long to stay out of the race after resigning
    pub resign_cooldown_ms: u64,
    /// Backoff after store errors
    pub backoff: BackoffConfig,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            key_prefix: "/shardset".into(),
            lease_ttl_ms: 10_000,
            renew_interval_ms: 0,
            resign_cooldown_ms: 10_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ElectionConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        if self.renew_interval_ms == 0 {
            Duration::from_millis((self.lease_ttl_ms / 3).max(1))
        } else {
            Duration::from_millis(self.renew_interval_ms)
        }
    }

    pub fn resign_cooldown(&self) -> Duration {
        Duration::from_millis(self.resign_cooldown_ms)
    }

    /// Lock key for a shard set
    pub fn election_key(&self, shard_set_id: u32) -> String {
        format!("{}/{}/lock", self.key_prefix, shard_set_id)
    }
}

enum Command {
    Resign(oneshot::Sender<Result<()>>),
    Reset(oneshot::Sender<Result<()>>),
}

struct Inner {
    config: ElectionConfig,
    store: Arc<dyn KvStore>,
    placement: Arc<PlacementManager>,
    lifecycle: Lifecycle,
    shard_set_id: OnceLock<u32>,
    state: Mutex<ElectionState>,
    changes: Watchable<ElectionState>,
    campaigning: AtomicBool,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
    metrics: OnceLock<ElectionMetrics>,
}

impl Inner {
    fn set_state(&self, next: ElectionState) {
        let prev = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, next)
        };
        if prev == next {
            return;
        }

        let shard_set_id = self.shard_set_id.get().copied().unwrap_or_default();
        info!("Shard set {} election state {} -> {}", shard_set_id, prev, next);
        if let Some(metrics) = self.metrics.get() {
            metrics.state.set(next.as_gauge());
            if next == ElectionState::Leader {
                metrics.leadership_gained.inc();
            } else if prev == ElectionState::Leader {
                metrics.leadership_lost.inc();
            }
        }
        let _ = self.changes.update(next);
    }

    fn state(&self) -> ElectionState {
        *self.state.lock()
    }

    fn record_store_error(&self, context: &str, e: &CoordError) {
        if let Some(metrics) = self.metrics.get() {
            metrics.store_errors.inc();
        }
        warn!("Election {} failed: {}", context, e);
    }
}

/// Campaigns for the flush lease of one shard set
pub struct ElectionManager {
    inner: Arc<Inner>,
}

impl ElectionManager {
    /// Create an election manager scoped by `placement`; call `open` to start
    pub fn new(config: ElectionConfig, store: Arc<dyn KvStore>, placement: Arc<PlacementManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                placement,
                lifecycle: Lifecycle::new(COMPONENT),
                shard_set_id: OnceLock::new(),
                state: Mutex::new(ElectionState::Unknown),
                changes: Watchable::new(),
                campaigning: AtomicBool::new(false),
                commands: Mutex::new(None),
                task: Mutex::new(None),
                shutdown: ShutdownSignal::new(),
                metrics: OnceLock::new(),
            }),
        }
    }

    /// Start campaigning for `shard_set_id`
    pub fn open(&self, shard_set_id: u32) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.begin_open()?;
        let _ = inner.shard_set_id.set(shard_set_id);
        let _ = inner.metrics.set(ElectionMetrics::new(shard_set_id));

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.commands.lock() = Some(tx);

        let campaign = Campaign {
            key: inner.config.election_key(shard_set_id),
            shard_set_id,
            lease: None,
            last_renewed: None,
            cooldown_until: None,
            backoff: Backoff::new(inner.config.backoff.clone()),
            inner: inner.clone(),
        };
        let handle = tokio::spawn(campaign.run(rx, inner.shutdown.subscribe()));
        *inner.task.lock() = Some(handle);

        inner.lifecycle.finish_open();
        info!(
            "Election manager opened for shard set {} as {}",
            shard_set_id,
            inner.placement.instance_id()
        );
        Ok(())
    }

    /// Current election state; never blocks
    pub fn election_state(&self) -> ElectionState {
        self.inner.state()
    }

    /// Whether the campaign is contending (leader or not)
    pub fn is_campaigning(&self) -> bool {
        self.inner.campaigning.load(Ordering::SeqCst)
    }

    /// Shard set this manager campaigns for, once opened
    pub fn shard_set_id(&self) -> Option<u32> {
        self.inner.shard_set_id.get().copied()
    }

    /// Release leadership if held
    ///
    /// When `cancel` completes before the store acknowledges, `Cancelled` is
    /// returned but the resignation keeps running in the campaign task: the
    /// lease may or may not have been released. Callers must re-check
    /// `election_state` after a cancelled resign.
    pub async fn resign(&self, cancel: impl Future<Output = ()>) -> Result<()> {
        let rx = self.send(Command::Resign)?;
        tokio::select! {
            biased;
            _ = cancel => Err(CoordError::Cancelled),
            ack = rx => ack.unwrap_or(Err(CoordError::NotOpen { component: COMPONENT })),
        }
    }

    /// Drop local campaign state and start a fresh campaign
    pub async fn reset(&self) -> Result<()> {
        let rx = self.send(Command::Reset)?;
        rx.await.unwrap_or(Err(CoordError::NotOpen { component: COMPONENT }))
    }

    /// Instance currently holding the lock, read from the store
    pub async fn leader(&self) -> Result<Option<String>> {
        let shard_set_id = self
            .shard_set_id()
            .ok_or(CoordError::NotOpen { component: COMPONENT })?;
        let key = self.inner.config.election_key(shard_set_id);
        let value = self.inner.store.get(&key).await?;
        Ok(value.map(|v| String::from_utf8_lossy(&v.data).into_owned()))
    }

    /// Subscribe to election state changes
    pub fn watch(&self) -> Result<Watch<ElectionState>> {
        self.inner.lifecycle.check_open()?;
        self.inner.changes.watch()
    }

    /// End the campaign, releasing the lease if held
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.close()?;
        inner.shutdown.shutdown();
        inner.commands.lock().take();

        let handle = inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Campaign task for shard set {:?} panicked: {}", self.shard_set_id(), e);
            }
        }
        inner.campaigning.store(false, Ordering::SeqCst);
        inner.changes.close();
        info!("Election manager closed for shard set {:?}", self.shard_set_id());
        Ok(())
    }

    pub fn metrics(&self) -> Option<&ElectionMetrics> {
        self.inner.metrics.get()
    }

    fn send(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.inner.lifecycle.check_open()?;
        let (tx, rx) = oneshot::channel();
        let commands = self.inner.commands.lock();
        let sender = commands
            .as_ref()
            .ok_or(CoordError::NotOpen { component: COMPONENT })?;
        sender
            .send(command(tx))
            .map_err(|_| CoordError::NotOpen { component: COMPONENT })?;
        Ok(rx)
    }
}

/// State owned by the background campaign task
struct Campaign {
    inner: Arc<Inner>,
    key: String,
    shard_set_id: u32,
    lease: Option<LeaseId>,
    last_renewed: Option<Instant>,
    cooldown_until: Option<Instant>,
    backoff: Backoff,
}

impl Campaign {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut shutdown: ShutdownListener) {
        let mut placement_watch = self.inner.placement.watch().ok();
        let mut key_watch: Option<KeyWatch> = None;
        let mut ticker = tokio::time::interval(self.inner.config.renew_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if key_watch.is_none() {
                key_watch = self.inner.store.watch(&self.key).await.ok();
            }
            let delay = self.step().await;

            tokio::select! {
                _ = shutdown.recv() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick(), if delay.is_none() => {}
                _ = sleep_for(delay) => {}
                _ = next_placement(&mut placement_watch) => {}
                event = next_key_event(&mut key_watch) => {
                    if let Err(e) = event {
                        debug!("Election key watch for shard set {} broke: {}", self.shard_set_id, e);
                        key_watch = None;
                    }
                }
            }
        }

        self.release_lease().await;
        self.inner.campaigning.store(false, Ordering::SeqCst);
        self.inner.set_state(ElectionState::Follower);
        debug!("Campaign for shard set {} stopped", self.shard_set_id);
    }

    /// Whether the local instance should contend under the active placement
    fn should_campaign(&self) -> bool {
        let placement = &self.inner.placement;
        let Ok((_, p)) = placement.placement() else {
            return false;
        };
        match p.instance(placement.instance_id()) {
            Some(instance) => {
                instance.shard_set_id == self.shard_set_id
                    && !(instance.is_retiring() && p.has_replacement_for(&instance.id))
            }
            None => false,
        }
    }

    /// One campaign round; returns a retry delay after store errors
    async fn step(&mut self) -> Option<Duration> {
        let enabled = self.should_campaign();
        let was_enabled = self.inner.campaigning.swap(enabled, Ordering::SeqCst);
        if enabled != was_enabled {
            info!(
                "Shard set {} campaign {}",
                self.shard_set_id,
                if enabled { "enabled" } else { "disabled by placement" }
            );
        }

        if !enabled {
            if self.inner.state() == ElectionState::Leader || self.lease.is_some() {
                self.release_lease().await;
            }
            self.inner.set_state(ElectionState::Follower);
            return None;
        }

        if let Some(until) = self.cooldown_until {
            let remaining = until.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                self.inner.set_state(ElectionState::Follower);
                return Some(remaining);
            }
            self.cooldown_until = None;
        }

        let lease = match self.ensure_lease().await {
            Ok(lease) => lease,
            Err(e) => {
                self.inner.record_store_error("lease renewal", &e);
                self.demote_if_lease_stale();
                return Some(self.backoff.next_delay());
            }
        };

        let value = Bytes::from(self.inner.placement.instance_id().to_string());
        match self.inner.store.create_with_lease(&self.key, value, lease).await {
            Ok(true) => {
                self.backoff.reset();
                self.inner.set_state(ElectionState::Leader);
                None
            }
            Ok(false) => {
                self.backoff.reset();
                self.inner.set_state(ElectionState::Follower);
                None
            }
            Err(CoordError::LeaseExpired { .. }) => {
                self.lease = None;
                self.inner.set_state(ElectionState::Follower);
                Some(self.backoff.next_delay())
            }
            Err(e) => {
                self.inner.record_store_error("lock acquisition", &e);
                self.demote_if_lease_stale();
                Some(self.backoff.next_delay())
            }
        }
    }

    /// Renew the current lease or grant a new one
    async fn ensure_lease(&mut self) -> Result<LeaseId> {
        if let Some(lease) = self.lease {
            match self.inner.store.keep_alive(lease).await {
                Ok(()) => {
                    self.last_renewed = Some(Instant::now());
                    return Ok(lease);
                }
                Err(CoordError::LeaseExpired { .. }) => {
                    warn!("Lease {} for shard set {} expired", lease, self.shard_set_id);
                    self.lease = None;
                    self.inner.set_state(ElectionState::Follower);
                }
                Err(e) => return Err(e),
            }
        }

        let lease = self.inner.store.grant_lease(self.inner.config.lease_ttl()).await?;
        debug!("Granted lease {} for shard set {}", lease, self.shard_set_id);
        self.lease = Some(lease);
        self.last_renewed = Some(Instant::now());
        Ok(lease)
    }

    /// Without a successful renewal for a full TTL the lease must be presumed lost
    fn demote_if_lease_stale(&mut self) {
        let stale = match self.last_renewed {
            Some(at) => at.elapsed() >= self.inner.config.lease_ttl(),
            None => true,
        };
        if stale {
            self.lease = None;
            self.inner.set_state(ElectionState::Follower);
        }
    }

    async fn release_lease(&mut self) -> Option<CoordError> {
        let lease = self.lease.take()?;
        match self.inner.store.revoke_lease(lease).await {
            Ok(()) => {
                debug!("Revoked lease {} for shard set {}", lease, self.shard_set_id);
                None
            }
            Err(e) => {
                self.inner.record_store_error("lease revocation", &e);
                Some(e)
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Resign(ack) => {
                let result = if self.inner.state() == ElectionState::Leader {
                    match self.release_lease().await {
                        None => {
                            self.cooldown_until = Some(Instant::now() + self.inner.config.resign_cooldown());
                            self.inner.set_state(ElectionState::Follower);
                            info!("Resigned leadership of shard set {}", self.shard_set_id);
                            Ok(())
                        }
                        Some(e) => Err(e),
                    }
                } else {
                    Ok(())
                };
                let _ = ack.send(result);
            }
            Command::Reset(ack) => {
                if let Some(e) = self.release_lease().await {
                    warn!("Lease release during reset failed, letting it expire: {}", e);
                }
                self.last_renewed = None;
                self.cooldown_until = None;
                self.backoff.reset();
                self.inner.set_state(ElectionState::Follower);
                info!("Reset campaign for shard set {}", self.shard_set_id);
                let _ = ack.send(Ok(()));
            }
        }
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn next_placement(watch: &mut Option<Watch<Arc<ActiveStagedPlacement>>>) {
    match watch {
        Some(w) => {
            if w.next().await.is_none() {
                *watch = None;
            }
        }
        None => std::future::pending().await,
    }
}

async fn next_key_event(watch: &mut Option<KeyWatch>) -> Result<()> {
    match watch {
        Some(w) => w.recv().await.map(|_| ()),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_derivations() {
        let config = ElectionConfig {
            lease_ttl_ms: 900,
            ..Default::default()
        };
        assert_eq!(config.renew_interval(), Duration::from_millis(300));
        assert_eq!(config.election_key(3), "/shardset/3/lock");

        let config = ElectionConfig {
            renew_interval_ms: 25,
            ..config
        };
        assert_eq!(config.renew_interval(), Duration::from_millis(25));
    }
}
