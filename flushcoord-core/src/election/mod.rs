//! Per-shard-set leader election
//!
//! Each shard set runs one lease-backed campaign; the holder of the lease
//! is the only instance allowed to flush the shard set.

pub mod manager;
pub mod state;

pub use manager::{ElectionConfig, ElectionManager};
pub use state::ElectionState;
