//! Stored types for metadata persistence.
//!
//! These types are serialized to redb via bincode.

use raidvol_common::VolumeSpec;
use serde::{Deserialize, Serialize};

/// Current on-disk record version
pub const STORED_SPEC_VERSION: u32 = 1;

/// Volume spec as persisted, with bookkeeping fields
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredVolumeSpec {
    pub version: u32,
    pub spec: VolumeSpec,
    /// Unix seconds of the last committed structural change
    pub updated_at: i64,
}

impl StoredVolumeSpec {
    #[must_use]
    pub fn new(spec: VolumeSpec) -> Self {
        Self {
            version: STORED_SPEC_VERSION,
            spec,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}
