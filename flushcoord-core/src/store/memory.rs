//! In-process coordination store
//!
//! Implements [`KvStore`] with a single revision counter, lease expiry
//! evaluated on every operation, and hooks for injecting failures.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{KeyWatch, KvStore, LeaseId, VersionedValue};
use crate::error::{CoordError, Result};

struct Entry {
    value: VersionedValue,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Default)]
struct Counters {
    gets: HashMap<String, u64>,
    watches: HashMap<String, u64>,
    writes: HashMap<String, u64>,
}

#[derive(Default)]
struct State {
    revision: u64,
    next_lease: LeaseId,
    entries: HashMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<Option<VersionedValue>>>>,
    counters: Counters,
}

impl State {
    fn notify(&mut self, key: &str, event: Option<VersionedValue>) {
        if let Some(senders) = self.watchers.get_mut(key) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn put(&mut self, key: &str, data: Bytes, lease: Option<LeaseId>) -> u64 {
        self.revision += 1;
        let value = VersionedValue {
            version: self.revision,
            data,
        };
        if let Some(old) = self.entries.insert(key.to_string(), Entry { value: value.clone(), lease }) {
            if let Some(old_lease) = old.lease.filter(|l| Some(*l) != lease) {
                if let Some(l) = self.leases.get_mut(&old_lease) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.insert(key.to_string());
        }
        *self.counters.writes.entry(key.to_string()).or_default() += 1;
        self.notify(key, Some(value));
        self.revision
    }

    fn remove(&mut self, key: &str) -> Option<VersionedValue> {
        let entry = self.entries.remove(key)?;
        if let Some(l) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.remove(key);
        }
        self.revision += 1;
        self.notify(key, None);
        Some(entry.value)
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        match self.leases.remove(&id) {
            Some(lease) => {
                for key in lease.keys {
                    if self.entries.get(&key).and_then(|e| e.lease) == Some(id) {
                        self.remove(&key);
                    }
                }
                true
            }
            None => false,
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!("Lease {} expired", id);
            self.drop_lease(id);
        }
    }
}

/// In-memory [`KvStore`] with failure injection and call counters
pub struct MemStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl MemStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordError::store("store is unavailable"))
        }
    }

    /// Lock state after applying lease expiry
    fn live_state(&self) -> Result<parking_lot::MutexGuard<'_, State>> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        Ok(state)
    }

    /// Make every operation fail with `StoreUnavailable` (and break watches)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.disconnect_watches();
        }
    }

    /// Break every open watch subscription
    pub fn disconnect_watches(&self) {
        self.state.lock().watchers.clear();
    }

    /// Expire the lease currently holding `key`, if any
    pub fn expire_key_lease(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.get(key).and_then(|e| e.lease) {
            Some(id) => state.drop_lease(id),
            None => false,
        }
    }

    /// Lease currently attached to `key`
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.state.lock().entries.get(key).and_then(|e| e.lease)
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        state.leases.len()
    }

    /// Number of `get` calls made for `key`
    pub fn get_count(&self, key: &str) -> u64 {
        self.state.lock().counters.gets.get(key).copied().unwrap_or(0)
    }

    /// Number of `watch` subscriptions opened for `key`
    pub fn watch_count(&self, key: &str) -> u64 {
        self.state.lock().counters.watches.get(key).copied().unwrap_or(0)
    }

    /// Number of successful writes to `key`
    pub fn write_count(&self, key: &str) -> u64 {
        self.state.lock().counters.writes.get(key).copied().unwrap_or(0)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let mut state = self.live_state()?;
        *state.counters.gets.entry(key.to_string()).or_default() += 1;
        Ok(state.entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<u64> {
        let mut state = self.live_state()?;
        Ok(state.put(key, data, None))
    }

    async fn check_and_set(&self, key: &str, expected: u64, data: Bytes) -> Result<u64> {
        let mut state = self.live_state()?;
        let actual = state.entries.get(key).map(|e| e.value.version).unwrap_or(0);
        if actual != expected {
            return Err(CoordError::VersionMismatch {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(state.put(key, data, None))
    }

    async fn delete(&self, key: &str) -> Result<Option<VersionedValue>> {
        let mut state = self.live_state()?;
        Ok(state.remove(key))
    }

    async fn watch(&self, key: &str) -> Result<KeyWatch> {
        let mut state = self.live_state()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.entry(key.to_string()).or_default().push(tx);
        *state.counters.watches.entry(key.to_string()).or_default() += 1;
        Ok(KeyWatch::new(key, rx))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.live_state()?;
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.live_state()?;
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(CoordError::LeaseExpired { lease_id: lease }),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.live_state()?;
        state.drop_lease(lease);
        Ok(())
    }

    async fn create_with_lease(&self, key: &str, data: Bytes, lease: LeaseId) -> Result<bool> {
        let mut state = self.live_state()?;
        if !state.leases.contains_key(&lease) {
            return Err(CoordError::LeaseExpired { lease_id: lease });
        }
        if let Some(entry) = state.entries.get(key) {
            return Ok(entry.lease == Some(lease));
        }
        state.put(key, data, Some(lease));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_and_set_versions() {
        let store = MemStore::new();
        let v1 = store.set_if_not_exists("k", Bytes::from_static(b"a")).await.unwrap();
        assert!(store.set_if_not_exists("k", Bytes::from_static(b"b")).await.is_err());

        let v2 = store.check_and_set("k", v1, Bytes::from_static(b"c")).await.unwrap();
        assert!(v2 > v1);

        let err = store.check_and_set("k", v1, Bytes::from_static(b"d")).await.unwrap_err();
        assert_eq!(
            err,
            CoordError::VersionMismatch { key: "k".into(), expected: v1, actual: v2 }
        );
        assert_eq!(store.get("k").await.unwrap().unwrap().data, Bytes::from_static(b"c"));
    }

    #[tokio::test]
    async fn test_lease_revoke_deletes_key_and_notifies() {
        let store = MemStore::new();
        let mut watch = store.watch("lock").await.unwrap();

        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        assert!(store.create_with_lease("lock", Bytes::from_static(b"i1"), lease).await.unwrap());
        assert!(store.create_with_lease("lock", Bytes::from_static(b"i1"), lease).await.unwrap());

        let other = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        assert!(!store.create_with_lease("lock", Bytes::from_static(b"i2"), other).await.unwrap());

        store.revoke_lease(lease).await.unwrap();
        assert!(store.get("lock").await.unwrap().is_none());
        assert!(watch.recv().await.unwrap().is_some());
        assert!(watch.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_expires_without_keep_alive() {
        let store = MemStore::new();
        let lease = store.grant_lease(Duration::from_millis(20)).await.unwrap();
        store.create_with_lease("lock", Bytes::from_static(b"i1"), lease).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("lock").await.unwrap().is_none());
        assert_eq!(
            store.keep_alive(lease).await.unwrap_err(),
            CoordError::LeaseExpired { lease_id: lease }
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_breaks_watches() {
        let store = MemStore::new();
        let mut watch = store.watch("k").await.unwrap();

        store.set_available(false);
        assert!(store.get("k").await.is_err());
        assert!(watch.recv().await.is_err());

        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.get_count("k"), 1);
    }
}
