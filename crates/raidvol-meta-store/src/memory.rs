//! In-process volume spec store.
//!
//! Used by tests and by the daemon's `--ephemeral` mode. Writes can be made
//! to fail on demand to exercise write-after-success ordering.

use crate::VolumeSpecStore;
use parking_lot::RwLock;
use raidvol_common::{Error, Result, VolumeId, VolumeSpec};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct MemoryStore {
    specs: RwLock<BTreeMap<VolumeId, VolumeSpec>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail with a transient error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Metadata("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl VolumeSpecStore for MemoryStore {
    fn get(&self, volume_id: &VolumeId) -> Result<VolumeSpec> {
        self.specs
            .read()
            .get(volume_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("volume spec {volume_id}")))
    }

    fn put(&self, spec: &VolumeSpec) -> Result<()> {
        self.check_writable()?;
        self.specs
            .write()
            .insert(spec.volume_id.clone(), spec.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, volume_id: &VolumeId) -> Result<()> {
        self.check_writable()?;
        self.specs.write().remove(volume_id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list(&self) -> Result<Vec<VolumeSpec>> {
        Ok(self.specs.read().values().cloned().collect())
    }
}
