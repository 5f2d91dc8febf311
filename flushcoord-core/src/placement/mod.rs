//! Shard placement
//!
//! Placement snapshots, staged placements with cutover times, and the
//! manager that keeps them current.

pub mod manager;
pub mod staged;
pub mod types;

pub use manager::{PlacementConfig, PlacementManager};
pub use staged::{ActiveStagedPlacement, StagedPlacement};
pub use types::{Instance, Placement, Shard, ShardState, Shards};
