//! Disk driver abstraction
//!
//! Uniform capability to create, open, close and delete the backing block
//! device of one replica. Drivers never retry; callers own retry policy.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use raidvol_common::{ReplicaAddress, ReplicaName, Result};
use serde::{Deserialize, Serialize};

/// What to allocate for a new replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingSpec {
    pub name: ReplicaName,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Attached bdev for one replica. Ephemeral: never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BdevHandle {
    /// Bdev name inside the data plane; equal to the replica name
    pub bdev: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Reference to a point-in-time copy of a replica
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub replica: String,
    pub name: String,
    pub path: PathBuf,
    pub created_at: i64,
}

#[async_trait]
pub trait DiskDriver: Send + Sync {
    /// Where the backing store for `address` lives
    fn resolve_path(&self, address: &ReplicaAddress) -> PathBuf;

    /// Allocate a backing store and attach its bdev.
    ///
    /// `AlreadyExists` if the store is present, `ResourceExhausted` if there
    /// is no room for it.
    async fn create_backing_store(&self, spec: &BackingSpec) -> Result<BdevHandle>;

    /// Attach the bdev of an existing backing store; `NotFound` if absent
    async fn open(&self, name: &ReplicaName, path: &Path) -> Result<BdevHandle>;

    /// Detach a bdev. Closing an already closed handle is a no-op.
    async fn close(&self, handle: &BdevHandle) -> Result<()>;

    /// Remove a backing store. Removing a missing store is a no-op.
    async fn delete_backing_store(&self, path: &Path) -> Result<()>;

    async fn snapshot(&self, handle: &BdevHandle, snapshot: &str) -> Result<SnapshotRef>;

    /// Probe the data plane for a live bdev with this name
    async fn lookup_bdev(&self, bdev: &str) -> Result<Option<BdevHandle>>;
}
