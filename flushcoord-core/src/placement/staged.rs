//! Staged placements
//!
//! A staged placement is a list of placements with increasing cutover
//! times. The active one at any instant is the latest whose cutover has
//! passed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::types::Placement;
use crate::error::{CoordError, Result};

/// Serialized form of the placement key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedPlacement {
    pub placements: Vec<Placement>,
}

impl StagedPlacement {
    pub fn new(placements: Vec<Placement>) -> Self {
        Self { placements }
    }

    /// A staged placement holding a single, immediately active placement
    pub fn single(placement: Placement) -> Self {
        Self::new(vec![placement])
    }

    /// Encode as the payload stored under the placement key
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Validated staged placement that resolves the active placement for a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStagedPlacement {
    placements: Vec<Placement>,
    store_version: u64,
}

impl ActiveStagedPlacement {
    /// Validate ordering; cutovers must strictly increase
    pub fn new(staged: StagedPlacement, store_version: u64) -> Result<Self> {
        if staged.placements.is_empty() {
            return Err(CoordError::InvalidPlacement {
                reason: "staged placement holds no placements".into(),
            });
        }
        for pair in staged.placements.windows(2) {
            if pair[1].cutover_nanos <= pair[0].cutover_nanos {
                return Err(CoordError::InvalidPlacement {
                    reason: format!(
                        "cutover {} does not follow {}",
                        pair[1].cutover_nanos, pair[0].cutover_nanos
                    ),
                });
            }
        }
        Ok(Self {
            placements: staged.placements,
            store_version,
        })
    }

    /// Placement active at `now_nanos`
    ///
    /// Before the first cutover nothing is active.
    pub fn active_placement_at(&self, now_nanos: i64) -> Result<&Placement> {
        let idx = self.placements.partition_point(|p| p.cutover_nanos <= now_nanos);
        if idx == 0 {
            return Err(CoordError::NoPlacement);
        }
        Ok(&self.placements[idx - 1])
    }

    /// Next placement waiting for its cutover after `now_nanos`
    pub fn next_placement_after(&self, now_nanos: i64) -> Option<&Placement> {
        self.placements.iter().find(|p| p.cutover_nanos > now_nanos)
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Store version the staged placement was read at
    pub fn store_version(&self) -> u64 {
        self.store_version
    }
}
