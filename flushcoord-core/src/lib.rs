//! Flushcoord Core - coordination for sharded stream aggregation
//!
//! This crate provides the shared state each aggregator instance needs
//! before it may flush a shard set:
//! - Placement tracking (which shards this instance owns, and when)
//! - Leader election per shard set over store leases
//! - Per-shard flush watermarks with monotonic, asynchronous persistence
//! - Change notification with one upstream subscription per key

pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod flush;
pub mod metrics;
pub mod placement;
pub mod runtime;
pub mod store;
pub mod watch;

mod lifecycle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordinatorConfig;
pub use election::{ElectionConfig, ElectionManager, ElectionState};
pub use error::{CoordError, Result};
pub use flush::{FlushTimesConfig, FlushTimesManager, ShardFlushTimes, ShardSetFlushTimes};
pub use placement::{PlacementConfig, PlacementManager};
pub use store::{KvStore, MemStore};
pub use watch::{Watch, Watchable};
