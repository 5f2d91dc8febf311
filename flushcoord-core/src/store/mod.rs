//! Coordination store interface
//!
//! The managers talk to a strongly-consistent key-value store offering
//! compare-and-swap writes, leases and per-key change notification. The
//! store itself is an external collaborator; [`MemStore`] implements the
//! interface in-process.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{CoordError, Result};

pub use memory::MemStore;

/// Identifier of a lease granted by the store
pub type LeaseId = u64;

/// A stored value with the store revision at which it was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub version: u64,
    pub data: Bytes,
}

/// Change subscription for a single key
///
/// Yields `Some(value)` on writes and `None` on deletes, in store order.
pub struct KeyWatch {
    key: String,
    events: mpsc::UnboundedReceiver<Option<VersionedValue>>,
}

impl KeyWatch {
    pub fn new(key: impl Into<String>, events: mpsc::UnboundedReceiver<Option<VersionedValue>>) -> Self {
        Self {
            key: key.into(),
            events,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next change for the key; an error means the subscription broke
    pub async fn recv(&mut self) -> Result<Option<VersionedValue>> {
        match self.events.recv().await {
            Some(event) => Ok(event),
            None => Err(CoordError::store(format!("watch on {} disconnected", self.key))),
        }
    }
}

/// Operations the managers require from the coordination store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the current value of a key
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Unconditionally write a key, returning the new version
    async fn set(&self, key: &str, data: Bytes) -> Result<u64>;

    /// Write a key only if its current version matches `expected`
    ///
    /// An `expected` of 0 requires the key to be absent.
    async fn check_and_set(&self, key: &str, expected: u64, data: Bytes) -> Result<u64>;

    /// Delete a key, returning the removed value
    async fn delete(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Subscribe to changes of a key
    async fn watch(&self, key: &str) -> Result<KeyWatch>;

    /// Grant a lease that expires unless renewed within `ttl`
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renew a lease; fails with `LeaseExpired` if it is gone
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Create `key` bound to `lease` if the key is absent
    ///
    /// Returns true when the key is bound to `lease` afterwards, false when
    /// it is held by another lease or was written without one.
    async fn create_with_lease(&self, key: &str, data: Bytes, lease: LeaseId) -> Result<bool>;

    /// Write a key only if it is absent
    async fn set_if_not_exists(&self, key: &str, data: Bytes) -> Result<u64> {
        self.check_and_set(key, 0, data).await
    }
}
