//! Flush time watermarks

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoordError, Result};
use crate::store::VersionedValue;

/// Watermark of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFlushTimes {
    /// End of the latest aggregation window durably flushed, unix nanos
    pub watermark_nanos: i64,
    /// Set once the shard is cut off and will never be flushed again
    #[serde(default)]
    pub tombstoned: bool,
}

impl ShardFlushTimes {
    pub fn new(watermark_nanos: i64) -> Self {
        Self {
            watermark_nanos,
            tombstoned: false,
        }
    }

    /// Later watermark wins; a tombstone is never cleared
    fn max_with(self, other: ShardFlushTimes) -> ShardFlushTimes {
        ShardFlushTimes {
            watermark_nanos: self.watermark_nanos.max(other.watermark_nanos),
            tombstoned: self.tombstoned || other.tombstoned,
        }
    }
}

/// Watermarks of every shard in a shard set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSetFlushTimes {
    #[serde(default)]
    pub shards: BTreeMap<u32, ShardFlushTimes>,
    /// Instance that produced this snapshot
    #[serde(default)]
    pub writer: String,
    /// Store version this snapshot was read at or written with
    #[serde(skip)]
    pub generation: u64,
}

impl ShardSetFlushTimes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style watermark for `shard`
    pub fn with_shard(mut self, shard: u32, watermark_nanos: i64) -> Self {
        self.shards.insert(shard, ShardFlushTimes::new(watermark_nanos));
        self
    }

    /// Mark `shard` as tombstoned
    pub fn with_tombstone(mut self, shard: u32) -> Self {
        self.shards
            .entry(shard)
            .or_insert_with(|| ShardFlushTimes::new(0))
            .tombstoned = true;
        self
    }

    pub fn watermark(&self, shard: u32) -> Option<i64> {
        self.shards.get(&shard).map(|s| s.watermark_nanos)
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Reject any shard whose proposed watermark is below `current`'s
    pub fn check_monotonic(&self, current: &ShardSetFlushTimes) -> Result<()> {
        for (shard, proposed) in &self.shards {
            if let Some(existing) = current.shards.get(shard) {
                if proposed.watermark_nanos < existing.watermark_nanos {
                    return Err(CoordError::NonMonotonicUpdate {
                        shard: *shard,
                        current: existing.watermark_nanos,
                        proposed: proposed.watermark_nanos,
                    });
                }
            }
        }
        Ok(())
    }

    /// `base` with the shards of `self` laid over it
    pub fn overlay(&self, base: &ShardSetFlushTimes) -> ShardSetFlushTimes {
        let mut merged = base.clone();
        for (shard, times) in &self.shards {
            let entry = merged.shards.entry(*shard).or_insert(*times);
            *entry = ShardFlushTimes {
                watermark_nanos: times.watermark_nanos,
                tombstoned: times.tombstoned || entry.tombstoned,
            };
        }
        merged.writer = self.writer.clone();
        merged
    }

    /// Per-shard maximum of both snapshots; keeps `self`'s writer
    pub fn merge_max(&self, other: &ShardSetFlushTimes) -> ShardSetFlushTimes {
        let mut merged = self.clone();
        for (shard, times) in &other.shards {
            merged
                .shards
                .entry(*shard)
                .and_modify(|t| *t = t.max_with(*times))
                .or_insert(*times);
        }
        merged.generation = self.generation.max(other.generation);
        merged
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a stored snapshot, taking its generation from the store version
    pub fn from_versioned(value: &VersionedValue) -> Result<Self> {
        let mut times: ShardSetFlushTimes = serde_json::from_slice(&value.data)?;
        times.generation = value.version;
        Ok(times)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_monotonic() {
        let current = ShardSetFlushTimes::new().with_shard(0, 100).with_shard(1, 100);

        let regress = ShardSetFlushTimes::new().with_shard(0, 90);
        assert_eq!(
            regress.check_monotonic(&current).unwrap_err(),
            CoordError::NonMonotonicUpdate { shard: 0, current: 100, proposed: 90 }
        );

        let same = ShardSetFlushTimes::new().with_shard(1, 100);
        assert!(same.check_monotonic(&current).is_ok());

        let new_shard = ShardSetFlushTimes::new().with_shard(7, 1);
        assert!(new_shard.check_monotonic(&current).is_ok());
    }

    #[test]
    fn test_overlay_keeps_untouched_shards() {
        let base = ShardSetFlushTimes::new().with_shard(0, 100).with_shard(1, 100).with_tombstone(1);
        let mut update = ShardSetFlushTimes::new().with_shard(0, 110).with_shard(1, 120);
        update.writer = "i2".into();

        let merged = update.overlay(&base);
        assert_eq!(merged.watermark(0), Some(110));
        assert_eq!(merged.watermark(1), Some(120));
        assert!(merged.shards[&1].tombstoned);
        assert_eq!(merged.writer, "i2");
    }

    #[test]
    fn test_merge_max() {
        let mut a = ShardSetFlushTimes::new().with_shard(0, 100).with_shard(1, 50);
        a.generation = 3;
        let mut b = ShardSetFlushTimes::new().with_shard(0, 90).with_shard(1, 70).with_shard(2, 5);
        b.generation = 9;

        let merged = a.merge_max(&b);
        assert_eq!(merged.watermark(0), Some(100));
        assert_eq!(merged.watermark(1), Some(70));
        assert_eq!(merged.watermark(2), Some(5));
        assert_eq!(merged.generation, 9);
    }

    #[test]
    fn test_generation_comes_from_store_version() {
        let times = ShardSetFlushTimes::new().with_shard(4, 1_000);
        let value = VersionedValue {
            version: 42,
            data: times.to_bytes().unwrap(),
        };
        let decoded = ShardSetFlushTimes::from_versioned(&value).unwrap();
        assert_eq!(decoded.generation, 42);
        assert_eq!(decoded.watermark(4), Some(1_000));
    }
}
