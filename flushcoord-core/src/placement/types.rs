//! Placement data model
//!
//! Instances, the shards they own, and versioned placement snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ownership state of a shard on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// Being handed to this instance
    Initializing,
    /// Owned and serving
    Available,
    /// Being handed away from this instance
    Leaving,
}

/// A shard assignment on one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: u32,
    pub state: ShardState,
    /// Instance this shard is migrating from, while initializing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Unix nanos from which the shard accepts writes
    #[serde(default)]
    pub cutover_nanos: i64,
    /// Unix nanos after which the shard stops accepting writes
    #[serde(default = "default_cutoff")]
    pub cutoff_nanos: i64,
}

fn default_cutoff() -> i64 {
    i64::MAX
}

impl Shard {
    pub fn new(id: u32, state: ShardState) -> Self {
        Self {
            id,
            state,
            source_id: None,
            cutover_nanos: 0,
            cutoff_nanos: i64::MAX,
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_cutover(mut self, cutover_nanos: i64) -> Self {
        self.cutover_nanos = cutover_nanos;
        self
    }

    pub fn with_cutoff(mut self, cutoff_nanos: i64) -> Self {
        self.cutoff_nanos = cutoff_nanos;
        self
    }

    /// Whether the shard accepts writes at `now_nanos`
    pub fn is_active_at(&self, now_nanos: i64) -> bool {
        self.cutover_nanos <= now_nanos && now_nanos < self.cutoff_nanos
    }
}

/// The shards owned by one instance, ordered by id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Shard>", into = "Vec<Shard>")]
pub struct Shards {
    by_id: BTreeMap<u32, Shard>,
}

impl Shards {
    pub fn new(shards: impl IntoIterator<Item = Shard>) -> Self {
        Self {
            by_id: shards.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.by_id.keys().copied().collect()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Shard> {
        self.by_id.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.by_id.values()
    }

    /// Shards currently in `state`
    pub fn shards_for_state(&self, state: ShardState) -> Vec<&Shard> {
        self.by_id.values().filter(|s| s.state == state).collect()
    }

    pub fn add(&mut self, shard: Shard) {
        self.by_id.insert(shard.id, shard);
    }
}

impl From<Vec<Shard>> for Shards {
    fn from(shards: Vec<Shard>) -> Self {
        Shards::new(shards)
    }
}

impl From<Shards> for Vec<Shard> {
    fn from(shards: Shards) -> Self {
        shards.by_id.into_values().collect()
    }
}

/// A process participating in the placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub zone: String,
    /// Shard set whose election and flush scope this instance joins
    pub shard_set_id: u32,
    #[serde(default)]
    pub shards: Shards,
}

impl Instance {
    pub fn new(id: impl Into<String>, shard_set_id: u32) -> Self {
        Self {
            id: id.into(),
            endpoint: String::new(),
            zone: String::new(),
            shard_set_id,
            shards: Shards::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_shards(mut self, shards: impl IntoIterator<Item = Shard>) -> Self {
        self.shards = Shards::new(shards);
        self
    }

    /// Whether every shard on this instance is leaving
    pub fn is_retiring(&self) -> bool {
        !self.shards.is_empty() && self.shards.iter().all(|s| s.state == ShardState::Leaving)
    }
}

/// Versioned snapshot of instance-to-shard ownership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default)]
    pub version: u64,
    /// Unix nanos at which this placement becomes active
    #[serde(default)]
    pub cutover_nanos: i64,
    #[serde(default)]
    pub num_shards: u32,
    #[serde(default = "default_replica_factor")]
    pub replica_factor: u32,
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
}

fn default_replica_factor() -> u32 {
    1
}

impl Placement {
    pub fn new(instances: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            version: 0,
            cutover_nanos: 0,
            num_shards: 0,
            replica_factor: 1,
            instances: instances.into_iter().map(|i| (i.id.clone(), i)).collect(),
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_cutover(mut self, cutover_nanos: i64) -> Self {
        self.cutover_nanos = cutover_nanos;
        self
    }

    pub fn with_num_shards(mut self, num_shards: u32) -> Self {
        self.num_shards = num_shards;
        self
    }

    pub fn with_replica_factor(mut self, replica_factor: u32) -> Self {
        self.replica_factor = replica_factor;
        self
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Instances that share `shard_set_id`
    pub fn instances_for_shard_set(&self, shard_set_id: u32) -> Vec<&Instance> {
        self.instances
            .values()
            .filter(|i| i.shard_set_id == shard_set_id)
            .collect()
    }

    /// Whether another instance in the same shard set is taking over `id`'s shards
    pub fn has_replacement_for(&self, id: &str) -> bool {
        let Some(local) = self.instance(id) else {
            return false;
        };
        if local.shards.shards_for_state(ShardState::Leaving).is_empty() {
            return false;
        }
        self.instances_for_shard_set(local.shard_set_id)
            .into_iter()
            .filter(|other| other.id != local.id)
            .any(|other| {
                other
                    .shards
                    .shards_for_state(ShardState::Initializing)
                    .iter()
                    .any(|s| s.source_id.as_deref() == Some(id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrating_placement() -> Placement {
        Placement::new(vec![
            Instance::new("old", 1).with_shards(vec![
                Shard::new(0, ShardState::Leaving),
                Shard::new(1, ShardState::Leaving),
            ]),
            Instance::new("new", 1).with_shards(vec![
                Shard::new(0, ShardState::Initializing).with_source("old"),
                Shard::new(1, ShardState::Initializing).with_source("old"),
            ]),
            Instance::new("peer", 2).with_shards(vec![Shard::new(2, ShardState::Available)]),
        ])
    }

    #[test]
    fn test_shards_for_state() {
        let shards = Shards::new(vec![
            Shard::new(3, ShardState::Available),
            Shard::new(1, ShardState::Leaving),
            Shard::new(2, ShardState::Available),
        ]);
        assert_eq!(shards.ids(), vec![1, 2, 3]);
        assert_eq!(shards.shards_for_state(ShardState::Available).len(), 2);
        assert!(shards.contains(1));
        assert!(!shards.contains(4));
    }

    #[test]
    fn test_replacement_detection() {
        let placement = migrating_placement();
        assert!(placement.has_replacement_for("old"));
        assert!(!placement.has_replacement_for("new"));
        assert!(!placement.has_replacement_for("peer"));
        assert!(!placement.has_replacement_for("missing"));
        assert!(placement.instance("old").unwrap().is_retiring());
    }

    #[test]
    fn test_replacement_requires_same_shard_set() {
        let mut placement = migrating_placement();
        placement.instances.get_mut("new").unwrap().shard_set_id = 9;
        assert!(!placement.has_replacement_for("old"));
    }

    #[test]
    fn test_shard_activity_window() {
        let shard = Shard::new(0, ShardState::Available).with_cutover(100).with_cutoff(200);
        assert!(!shard.is_active_at(99));
        assert!(shard.is_active_at(100));
        assert!(!shard.is_active_at(200));
    }

    #[test]
    fn test_placement_json_shape() {
        let placement = migrating_placement().with_version(4);
        let encoded = serde_json::to_string(&placement).unwrap();
        let decoded: Placement = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, placement);
    }
}
