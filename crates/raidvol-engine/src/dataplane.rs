//! Data-plane RAID primitives
//!
//! The data plane keeps no RAID topology across its own restarts. Everything
//! returned here is live state, to be compared against the durable
//! `VolumeSpec`, never trusted as durable itself.

use async_trait::async_trait;
use raidvol_common::{FrontendType, RaidLevel, Result};

/// Live view of a RAID bdev as reported by the data plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaidInfo {
    pub name: String,
    pub level: RaidLevel,
    /// Member bdev names in array order
    pub members: Vec<String>,
    /// A member is missing or not yet synchronized
    pub degraded: bool,
    /// Writes are stopped
    pub quiesced: bool,
}

/// Progress of a rebuild
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    /// No rebuild is running
    Idle,
    InProgress { percent: u8 },
    Complete,
    /// Synchronization hit a permanent error
    Failed,
}

#[async_trait]
pub trait RaidPlane: Send + Sync {
    async fn get_raid(&self, name: &str) -> Result<Option<RaidInfo>>;

    /// Assemble a RAID bdev from bdevs, in order. `AlreadyExists` if a RAID
    /// bdev with this name is live.
    ///
    /// `stale` members sit in their slots but hold no valid data: the array
    /// comes up degraded and they are filled in by the next rebuild.
    async fn create_raid(
        &self,
        name: &str,
        level: RaidLevel,
        members: &[String],
        stale: &[String],
    ) -> Result<()>;

    /// Tear down a RAID bdev; deleting an absent one is a no-op
    async fn delete_raid(&self, name: &str) -> Result<()>;

    /// Insert a member at `slot` (clamped to the member count). The array is
    /// degraded until it is rebuilt.
    async fn add_member(&self, name: &str, bdev: &str, slot: usize) -> Result<()>;

    /// Detach a member. The array must be quiesced.
    async fn remove_member(&self, name: &str, bdev: &str) -> Result<()>;

    async fn quiesce(&self, name: &str) -> Result<()>;

    async fn resume(&self, name: &str) -> Result<()>;

    async fn start_rebuild(&self, name: &str) -> Result<()>;

    async fn sync_status(&self, name: &str) -> Result<SyncStatus>;

    /// Publish the RAID bdev through a frontend and return its endpoint
    async fn expose(&self, name: &str, frontend: FrontendType) -> Result<String>;

    /// Withdraw a frontend; a no-op if nothing is exposed
    async fn unexpose(&self, name: &str) -> Result<()>;
}
