//! Election state per shard set

use serde::{Deserialize, Serialize};
use std::fmt;

/// Leadership state of the local instance for one shard set
///
/// Leadership is leased: the store may revoke it at any time, so callers
/// re-read the state instead of caching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElectionState {
    /// Campaign has not yet reached a verdict
    Unknown,
    /// Another instance holds (or may hold) the flush lease
    Follower,
    /// This instance holds the flush lease
    Leader,
}

impl ElectionState {
    /// Value reported through the state gauge
    pub fn as_gauge(self) -> i64 {
        match self {
            ElectionState::Unknown => 0,
            ElectionState::Follower => 1,
            ElectionState::Leader => 2,
        }
    }

    pub fn is_leader(self) -> bool {
        self == ElectionState::Leader
    }
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElectionState::Unknown => "unknown",
            ElectionState::Follower => "follower",
            ElectionState::Leader => "leader",
        };
        f.write_str(name)
    }
}
