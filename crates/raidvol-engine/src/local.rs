//! Local reference data plane
//!
//! Backing stores are sparse files under a replica directory. Bdevs and RAID
//! arrays live only in memory, so [`LocalDataPlane::restart`] models a data
//! plane that came back without any RAID topology while the files survived.
//!
//! Faults can be injected through [`FaultPlan`] to exercise timeouts, sync
//! failures and transient driver errors.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use raidvol_common::config::FrontendConfig;
use raidvol_common::{
    Error, FrontendType, RaidLevel, ReplicaAddress, ReplicaName, Result,
};
use tracing::{debug, info, warn};

use crate::dataplane::{RaidInfo, RaidPlane, SyncStatus};
use crate::driver::{BackingSpec, BdevHandle, DiskDriver, SnapshotRef};

/// Injectable faults. Counters are decremented as faults fire; `u32::MAX`
/// means the fault fires forever.
#[derive(Debug, Default)]
pub struct FaultPlan {
    create_raid_hangs: AtomicU32,
    hang_after_create: AtomicU32,
    sync_errors: AtomicU32,
    sync_failed: AtomicBool,
    open_errors: AtomicU32,
    start_rebuild_errors: AtomicU32,
    lookup_hangs: AtomicU32,
}

impl FaultPlan {
    /// The next `times` RAID create calls hang before doing anything
    pub fn hang_create_raid(&self, times: u32) {
        self.create_raid_hangs.store(times, Ordering::SeqCst);
    }

    /// The next `times` RAID create calls assemble the array, then hang
    pub fn hang_after_create_raid(&self, times: u32) {
        self.hang_after_create.store(times, Ordering::SeqCst);
    }

    /// The next `times` sync polls return a transient error
    pub fn fail_sync_polls(&self, times: u32) {
        self.sync_errors.store(times, Ordering::SeqCst);
    }

    /// Every rebuild reports a permanent failure
    pub fn set_sync_failed(&self, failed: bool) {
        self.sync_failed.store(failed, Ordering::SeqCst);
    }

    /// The next `times` bdev opens fail with a transient I/O error
    pub fn fail_open(&self, times: u32) {
        self.open_errors.store(times, Ordering::SeqCst);
    }

    /// The next `times` rebuild starts fail with a transient I/O error
    pub fn fail_start_rebuild(&self, times: u32) {
        self.start_rebuild_errors.store(times, Ordering::SeqCst);
    }

    /// The next `times` bdev lookups never return
    pub fn hang_lookups(&self, times: u32) {
        self.lookup_hangs.store(times, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[derive(Debug, Clone)]
struct LocalRaid {
    level: RaidLevel,
    members: Vec<String>,
    degraded: bool,
    quiesced: bool,
    rebuild: Option<u8>,
    endpoint: Option<String>,
}

/// Rebuild progress made per sync poll, in percent
const REBUILD_STEP: u8 = 25;

/// In-process data plane over local files
pub struct LocalDataPlane {
    replica_dir: PathBuf,
    frontend: FrontendConfig,
    capacity_bytes: Option<u64>,
    bdevs: Mutex<HashMap<String, BdevHandle>>,
    raids: Mutex<HashMap<String, LocalRaid>>,
    allocations: Mutex<HashMap<PathBuf, u64>>,
    faults: FaultPlan,
    create_raid_calls: AtomicU32,
}

impl LocalDataPlane {
    pub fn new(replica_dir: impl Into<PathBuf>, frontend: FrontendConfig) -> Self {
        Self {
            replica_dir: replica_dir.into(),
            frontend,
            capacity_bytes: None,
            bdevs: Mutex::new(HashMap::new()),
            raids: Mutex::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
            faults: FaultPlan::default(),
            create_raid_calls: AtomicU32::new(0),
        }
    }

    /// Refuse allocations beyond this many bytes in total
    #[must_use]
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Number of RAID create calls received so far
    pub fn create_raid_calls(&self) -> u32 {
        self.create_raid_calls.load(Ordering::SeqCst)
    }

    /// Drop all bdevs and arrays; backing files stay on disk
    pub fn restart(&self) {
        self.raids.lock().clear();
        self.bdevs.lock().clear();
        info!("Local data plane restarted, RAID topology discarded");
    }

    /// Drop all arrays but keep bdevs attached
    pub fn drop_raids(&self) {
        self.raids.lock().clear();
    }

    /// Simulate the loss of one bdev: it disappears and its arrays degrade
    pub fn fail_bdev(&self, bdev: &str) {
        self.bdevs.lock().remove(bdev);
        for raid in self.raids.lock().values_mut() {
            if let Some(pos) = raid.members.iter().position(|m| m == bdev) {
                raid.members.remove(pos);
                raid.degraded = true;
            }
        }
        warn!(bdev, "Local bdev failed");
    }

    pub fn raid_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.raids.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn claimed_by(&self, bdev: &str) -> Option<String> {
        self.raids
            .lock()
            .iter()
            .find(|(_, r)| r.members.iter().any(|m| m == bdev))
            .map(|(name, _)| name.clone())
    }

    fn endpoint_for(&self, name: &str, frontend: FrontendType) -> String {
        match frontend {
            FrontendType::None => String::new(),
            FrontendType::Nvmf => format!(
                "nvmf://{}:{}/{}:{}",
                self.frontend.advertise_host, self.frontend.nvmf_port, self.frontend.nqn_prefix, name
            ),
            FrontendType::Blockdev => self.frontend.blockdev_dir.join(name).display().to_string(),
        }
    }

    fn snapshot_path(path: &Path, snapshot: &str) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(format!(".{snapshot}.snap"));
        PathBuf::from(s)
    }

    fn remove_snapshots(path: &Path) -> std::io::Result<()> {
        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Ok(());
        };
        let prefix = format!("{}.", file_name.to_string_lossy());
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".snap") {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Run file I/O on the blocking pool so a deadline on the caller can fire
async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| Error::internal(format!("file task failed: {e}")))?
        .map_err(Error::from)
}

fn create_sparse(path: &Path, size_bytes: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_len(size_bytes)?;
    file.sync_all()
}

#[async_trait]
impl DiskDriver for LocalDataPlane {
    fn resolve_path(&self, address: &ReplicaAddress) -> PathBuf {
        let p = Path::new(address.as_str());
        if p.is_absolute() {
            p.to_path_buf()
        } else if p.extension().is_some() {
            self.replica_dir.join(p)
        } else {
            self.replica_dir.join(format!("{address}.img"))
        }
    }

    async fn create_backing_store(&self, spec: &BackingSpec) -> Result<BdevHandle> {
        if spec.path.exists() {
            return Err(Error::already_exists(format!(
                "backing store {}",
                spec.path.display()
            )));
        }
        if let Some(capacity) = self.capacity_bytes {
            let used: u64 = self.allocations.lock().values().sum();
            if used.saturating_add(spec.size_bytes) > capacity {
                return Err(Error::ResourceExhausted(format!(
                    "need {} bytes, {} of {} in use",
                    spec.size_bytes, used, capacity
                )));
            }
        }
        let (path, size_bytes) = (spec.path.clone(), spec.size_bytes);
        blocking(move || create_sparse(&path, size_bytes)).await?;

        self.allocations
            .lock()
            .insert(spec.path.clone(), spec.size_bytes);
        let handle = BdevHandle {
            bdev: spec.name.to_string(),
            path: spec.path.clone(),
            size_bytes: spec.size_bytes,
        };
        self.bdevs
            .lock()
            .insert(handle.bdev.clone(), handle.clone());
        debug!(bdev = %handle.bdev, path = %spec.path.display(), "created backing store");
        Ok(handle)
    }

    async fn open(&self, name: &ReplicaName, path: &Path) -> Result<BdevHandle> {
        if FaultPlan::take(&self.faults.open_errors) {
            return Err(Error::TransientIo(format!("injected open failure for {name}")));
        }
        if let Some(existing) = self.bdevs.lock().get(name.as_str()) {
            if existing.path == path {
                return Ok(existing.clone());
            }
            return Err(Error::Conflict(format!(
                "bdev {name} is attached to {}",
                existing.path.display()
            )));
        }
        let probe = path.to_path_buf();
        let size_bytes = match blocking(move || fs::metadata(probe).map(|m| m.len())).await {
            Err(Error::Io(e)) if e.kind() == IoErrorKind::NotFound => {
                return Err(Error::not_found(format!("backing store {}", path.display())));
            }
            other => other?,
        };
        self.allocations
            .lock()
            .insert(path.to_path_buf(), size_bytes);
        let handle = BdevHandle {
            bdev: name.to_string(),
            path: path.to_path_buf(),
            size_bytes,
        };
        self.bdevs
            .lock()
            .insert(handle.bdev.clone(), handle.clone());
        Ok(handle)
    }

    async fn close(&self, handle: &BdevHandle) -> Result<()> {
        if let Some(raid) = self.claimed_by(&handle.bdev) {
            return Err(Error::Busy(format!(
                "bdev {} is a member of {raid}",
                handle.bdev
            )));
        }
        self.bdevs.lock().remove(&handle.bdev);
        Ok(())
    }

    async fn delete_backing_store(&self, path: &Path) -> Result<()> {
        if let Some(handle) = self.bdevs.lock().values().find(|h| h.path == path) {
            return Err(Error::Busy(format!(
                "backing store {} is attached as {}",
                path.display(),
                handle.bdev
            )));
        }
        let target = path.to_path_buf();
        blocking(move || {
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            Self::remove_snapshots(&target)
        })
        .await?;
        self.allocations.lock().remove(path);
        Ok(())
    }

    async fn snapshot(&self, handle: &BdevHandle, snapshot: &str) -> Result<SnapshotRef> {
        if !self.bdevs.lock().contains_key(&handle.bdev) {
            return Err(Error::not_found(format!("bdev {}", handle.bdev)));
        }
        let target = Self::snapshot_path(&handle.path, snapshot);
        if target.exists() {
            return Err(Error::already_exists(format!(
                "snapshot {snapshot} of {}",
                handle.bdev
            )));
        }
        let (source, copy) = (handle.path.clone(), target.clone());
        blocking(move || fs::copy(source, copy)).await?;
        Ok(SnapshotRef {
            replica: handle.bdev.clone(),
            name: snapshot.to_string(),
            path: target,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    async fn lookup_bdev(&self, bdev: &str) -> Result<Option<BdevHandle>> {
        if FaultPlan::take(&self.faults.lookup_hangs) {
            std::future::pending::<()>().await;
        }
        Ok(self.bdevs.lock().get(bdev).cloned())
    }
}

#[async_trait]
impl RaidPlane for LocalDataPlane {
    async fn get_raid(&self, name: &str) -> Result<Option<RaidInfo>> {
        Ok(self.raids.lock().get(name).map(|r| RaidInfo {
            name: name.to_string(),
            level: r.level,
            members: r.members.clone(),
            degraded: r.degraded,
            quiesced: r.quiesced,
        }))
    }

    async fn create_raid(
        &self,
        name: &str,
        level: RaidLevel,
        members: &[String],
        stale: &[String],
    ) -> Result<()> {
        self.create_raid_calls.fetch_add(1, Ordering::SeqCst);
        if FaultPlan::take(&self.faults.create_raid_hangs) {
            std::future::pending::<()>().await;
        }

        if self.raids.lock().contains_key(name) {
            return Err(Error::already_exists(format!("raid {name}")));
        }
        if members.len() < level.min_members() {
            return Err(Error::invalid_argument(format!(
                "{level} needs at least {} members",
                level.min_members()
            )));
        }
        {
            let bdevs = self.bdevs.lock();
            if let Some(missing) = members.iter().find(|m| !bdevs.contains_key(m.as_str())) {
                return Err(Error::not_found(format!("bdev {missing}")));
            }
        }
        if let Some(unknown) = stale.iter().find(|s| !members.contains(s)) {
            return Err(Error::invalid_argument(format!(
                "stale bdev {unknown} is not a member of {name}"
            )));
        }
        for member in members {
            if let Some(owner) = self.claimed_by(member) {
                return Err(Error::Conflict(format!("bdev {member} is claimed by {owner}")));
            }
        }

        self.raids.lock().insert(
            name.to_string(),
            LocalRaid {
                level,
                members: members.to_vec(),
                degraded: !stale.is_empty(),
                quiesced: false,
                rebuild: None,
                endpoint: None,
            },
        );

        if FaultPlan::take(&self.faults.hang_after_create) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn delete_raid(&self, name: &str) -> Result<()> {
        self.raids.lock().remove(name);
        Ok(())
    }

    async fn add_member(&self, name: &str, bdev: &str, slot: usize) -> Result<()> {
        if !self.bdevs.lock().contains_key(bdev) {
            return Err(Error::not_found(format!("bdev {bdev}")));
        }
        if let Some(owner) = self.claimed_by(bdev) {
            if owner == name {
                return Ok(());
            }
            return Err(Error::Conflict(format!("bdev {bdev} is claimed by {owner}")));
        }
        let mut raids = self.raids.lock();
        let raid = raids
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("raid {name}")))?;
        let slot = slot.min(raid.members.len());
        raid.members.insert(slot, bdev.to_string());
        raid.degraded = true;
        Ok(())
    }

    async fn remove_member(&self, name: &str, bdev: &str) -> Result<()> {
        let mut raids = self.raids.lock();
        let raid = raids
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("raid {name}")))?;
        let pos = raid
            .members
            .iter()
            .position(|m| m == bdev)
            .ok_or_else(|| Error::mismatch(format!("{bdev} is not a member of {name}")))?;
        if !raid.quiesced {
            return Err(Error::Busy(format!("raid {name} must be quiesced")));
        }
        if raid.members.len() <= 1 {
            return Err(Error::invalid_argument(format!(
                "cannot remove the last member of {name}"
            )));
        }
        raid.members.remove(pos);
        raid.degraded = true;
        Ok(())
    }

    async fn quiesce(&self, name: &str) -> Result<()> {
        let mut raids = self.raids.lock();
        let raid = raids
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("raid {name}")))?;
        raid.quiesced = true;
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<()> {
        let mut raids = self.raids.lock();
        let raid = raids
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("raid {name}")))?;
        raid.quiesced = false;
        Ok(())
    }

    async fn start_rebuild(&self, name: &str) -> Result<()> {
        if FaultPlan::take(&self.faults.start_rebuild_errors) {
            return Err(Error::TransientIo(format!("injected rebuild start failure on {name}")));
        }
        let mut raids = self.raids.lock();
        let raid = raids
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("raid {name}")))?;
        if raid.degraded && raid.rebuild.is_none() {
            raid.rebuild = Some(0);
        }
        Ok(())
    }

    async fn sync_status(&self, name: &str) -> Result<SyncStatus> {
        if FaultPlan::take(&self.faults.sync_errors) {
            return Err(Error::TransientIo(format!("injected sync error on {name}")));
        }
        let failed = self.faults.sync_failed.load(Ordering::SeqCst);
        let mut raids = self.raids.lock();
        let raid = raids
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("raid {name}")))?;
        Ok(match raid.rebuild {
            Some(_) if failed => SyncStatus::Failed,
            Some(progress) => {
                let next = progress.saturating_add(REBUILD_STEP);
                if next >= 100 {
                    raid.rebuild = None;
                    raid.degraded = false;
                    SyncStatus::Complete
                } else {
                    raid.rebuild = Some(next);
                    SyncStatus::InProgress { percent: next }
                }
            }
            None if raid.degraded => SyncStatus::Idle,
            None => SyncStatus::Complete,
        })
    }

    async fn expose(&self, name: &str, frontend: FrontendType) -> Result<String> {
        let endpoint = self.endpoint_for(name, frontend);
        let mut raids = self.raids.lock();
        let raid = raids
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("raid {name}")))?;
        raid.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn unexpose(&self, name: &str) -> Result<()> {
        if let Some(raid) = self.raids.lock().get_mut(name) {
            raid.endpoint = None;
        }
        Ok(())
    }
}
