//! Flush time tracking
//!
//! Per-shard watermarks of the highest aggregation window durably flushed,
//! persisted asynchronously with monotonic guarantees.

pub mod manager;
pub mod times;

pub use manager::{FlushTimesConfig, FlushTimesManager};
pub use times::{ShardFlushTimes, ShardSetFlushTimes};
