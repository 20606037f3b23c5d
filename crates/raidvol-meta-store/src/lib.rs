//! raidvol Metadata Store - durable volume specifications
//!
//! The [`VolumeSpecStore`] trait is the boundary the engine talks to. Two
//! implementations ship here: [`MetaStore`] persists to redb and
//! [`MemoryStore`] keeps everything in process for tests and dry runs.

pub mod memory;
pub mod store;
pub mod tables;
pub mod types;

pub use memory::MemoryStore;
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
pub use types::StoredVolumeSpec;

use raidvol_common::{Result, VolumeId, VolumeSpec};

/// Durable record of desired replica set, RAID level and frontend per volume.
///
/// Writes are only issued after the matching data-plane change has been
/// confirmed, so an implementation never has to reason about partially
/// applied topology.
pub trait VolumeSpecStore: Send + Sync {
    /// Read one spec; `NotFound` if the volume is unknown
    fn get(&self, volume_id: &VolumeId) -> Result<VolumeSpec>;

    /// Insert or replace a spec
    fn put(&self, spec: &VolumeSpec) -> Result<()>;

    /// Remove a spec; removing an unknown volume is not an error
    fn delete(&self, volume_id: &VolumeId) -> Result<()>;

    /// All stored specs, ordered by volume id
    fn list(&self) -> Result<Vec<VolumeSpec>>;
}
