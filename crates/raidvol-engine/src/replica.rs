//! Replica management
//!
//! Owns the lifecycle of the replicas of one volume. Each replica sits behind
//! its own async mutex; callers that need several replicas at once go through
//! [`ReplicaManager::lock_many`], which always locks in name order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use raidvol_common::{
    Error, ErrorKind, OpContext, ReplicaAddress, ReplicaName, Result, ResultExt, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::deadline::bounded;
use crate::driver::{BackingSpec, BdevHandle, DiskDriver, SnapshotRef};

/// Replica lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Backing store is being allocated
    Creating,
    /// Bdev attached and usable
    Open,
    /// Backing store present, bdev detached
    Closed,
    /// Backing store is being removed
    Deleting,
    /// Last operation failed; see `last_error`
    Error,
}

/// One replica of a volume
#[derive(Debug, Clone)]
pub struct Replica {
    pub name: ReplicaName,
    pub address: ReplicaAddress,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub state: ReplicaState,
    /// Present only while `Open`
    pub bdev: Option<BdevHandle>,
    /// Member of the assembled RAID bdev
    pub constituent: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_error: Option<String>,
}

impl Replica {
    fn new(name: ReplicaName, address: ReplicaAddress, path: PathBuf, size_bytes: u64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            name,
            address,
            path,
            size_bytes,
            state: ReplicaState::Creating,
            bdev: None,
            constituent: false,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    fn set_state(&mut self, state: ReplicaState) {
        if matches!(state, ReplicaState::Deleting | ReplicaState::Error) {
            self.bdev = None;
        }
        if state != ReplicaState::Error {
            self.last_error = None;
        }
        self.state = state;
        self.updated_at = chrono::Utc::now().timestamp();
    }

    fn attach(&mut self, handle: BdevHandle) {
        self.size_bytes = handle.size_bytes;
        self.bdev = Some(handle);
        self.set_state(ReplicaState::Open);
    }

    fn fail(&mut self, err: &Error) {
        self.set_state(ReplicaState::Error);
        self.last_error = Some(err.to_string());
    }

    /// Attached bdev; `Conflict` unless the replica is open
    pub fn handle(&self) -> Result<&BdevHandle> {
        match (&self.bdev, self.state) {
            (Some(handle), ReplicaState::Open) => Ok(handle),
            _ => Err(Error::Conflict(format!(
                "replica {} is {:?}, not open",
                self.name, self.state
            ))),
        }
    }

    fn context(&self, operation: &'static str) -> OpContext {
        OpContext::new(operation).replica(&self.name)
    }
}

pub type ReplicaGuard = OwnedMutexGuard<Replica>;

/// Replica manager for one volume
pub struct ReplicaManager {
    driver: Arc<dyn DiskDriver>,
    op_timeout: Duration,
    open_retry: RetryPolicy,
    replicas: RwLock<BTreeMap<ReplicaName, Arc<Mutex<Replica>>>>,
    /// Last published state per replica, readable without async locks
    summaries: RwLock<BTreeMap<ReplicaName, ReplicaState>>,
}

impl ReplicaManager {
    pub fn new(driver: Arc<dyn DiskDriver>, op_timeout: Duration, open_retry: RetryPolicy) -> Self {
        Self {
            driver,
            op_timeout,
            open_retry,
            replicas: RwLock::new(BTreeMap::new()),
            summaries: RwLock::new(BTreeMap::new()),
        }
    }

    fn publish(&self, replica: &Replica) {
        self.summaries
            .write()
            .insert(replica.name.clone(), replica.state);
    }

    fn insert_record(&self, replica: Replica) -> Result<Arc<Mutex<Replica>>> {
        let mut replicas = self.replicas.write();
        if replicas.contains_key(&replica.name) {
            return Err(Error::already_exists(format!("replica {}", replica.name)));
        }
        self.publish(&replica);
        let name = replica.name.clone();
        let entry = Arc::new(Mutex::new(replica));
        replicas.insert(name, Arc::clone(&entry));
        Ok(entry)
    }

    fn remove_record(&self, name: &ReplicaName) {
        self.replicas.write().remove(name);
        self.summaries.write().remove(name);
    }

    /// Replica record by name
    pub fn get(&self, name: &str) -> Result<Arc<Mutex<Replica>>> {
        self.replicas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("replica {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.replicas.read().contains_key(name)
    }

    /// Known replica names, sorted
    pub fn list(&self) -> Vec<ReplicaName> {
        self.replicas.read().keys().cloned().collect()
    }

    /// Published replica states, sorted by name
    pub fn states(&self) -> BTreeMap<String, ReplicaState> {
        self.summaries
            .read()
            .iter()
            .map(|(name, state)| (name.to_string(), *state))
            .collect()
    }

    /// Copy of a replica record
    pub async fn describe(&self, name: &str) -> Result<Replica> {
        let entry = self.get(name)?;
        let replica = entry.lock().await;
        Ok(replica.clone())
    }

    /// Lock several replicas in name order. Duplicate names are locked once.
    pub async fn lock_many(&self, names: &[ReplicaName]) -> Result<Vec<ReplicaGuard>> {
        let mut sorted: Vec<&ReplicaName> = names.iter().collect();
        sorted.sort();
        sorted.dedup();

        let entries = sorted
            .into_iter()
            .map(|name| self.get(name.as_str()))
            .collect::<Result<Vec<_>>>()?;

        let mut guards = Vec::with_capacity(entries.len());
        for entry in entries {
            guards.push(entry.lock_owned().await);
        }
        Ok(guards)
    }

    /// Allocate a new replica and open its bdev.
    ///
    /// On failure no record is left behind.
    pub async fn create(&self, address: &ReplicaAddress, size_bytes: u64) -> Result<ReplicaName> {
        let name = address.name()?;
        let path = self.driver.resolve_path(address);
        let entry = self.insert_record(Replica::new(
            name.clone(),
            address.clone(),
            path.clone(),
            size_bytes,
        ))?;
        let mut replica = entry.lock().await;

        let spec = BackingSpec {
            name: name.clone(),
            path,
            size_bytes,
        };
        let created = bounded(
            "create backing store",
            self.op_timeout,
            self.driver.create_backing_store(&spec),
        )
        .await;

        match created {
            Ok(handle) => {
                replica.attach(handle);
                self.publish(&replica);
                info!(replica = %name, path = %spec.path.display(), size_bytes, "created replica");
                Ok(name)
            }
            Err(e) => {
                if e.kind() != ErrorKind::AlreadyExists {
                    self.discard_partial(&spec).await;
                }
                self.remove_record(&name);
                Err(e.with_context(replica.context("create replica")))
            }
        }
    }

    /// Best-effort cleanup of a store whose creation did not complete
    async fn discard_partial(&self, spec: &BackingSpec) {
        let cleanup = async {
            if let Some(handle) = self.driver.lookup_bdev(spec.name.as_str()).await? {
                self.driver.close(&handle).await?;
            }
            self.driver.delete_backing_store(&spec.path).await
        };
        if let Err(e) = bounded("discard backing store", self.op_timeout, cleanup).await {
            warn!(replica = %spec.name, "failed to discard partial backing store: {e}");
        }
    }

    /// Bring a replica named in a volume spec under management.
    ///
    /// Reattaches a live bdev if the data plane still has one, otherwise
    /// opens the existing backing store, otherwise allocates a fresh one.
    /// Returns `true` when the backing store was freshly allocated and so
    /// holds no volume data.
    pub async fn adopt(&self, address: &ReplicaAddress, size_bytes: u64) -> Result<bool> {
        let name = address.name()?;
        let entry = match self.get(name.as_str()) {
            Ok(entry) => entry,
            Err(_) => {
                let path = self.driver.resolve_path(address);
                let record = Replica::new(name.clone(), address.clone(), path, size_bytes);
                match self.insert_record(record) {
                    Ok(entry) => entry,
                    Err(_) => self.get(name.as_str())?,
                }
            }
        };
        let mut replica = entry.lock().await;
        if replica.state == ReplicaState::Open {
            // The bdev may have vanished under us
            if bounded("probe bdev", self.op_timeout, self.driver.lookup_bdev(name.as_str()))
                .await?
                .is_some_and(|h| h.path == replica.path)
            {
                return Ok(false);
            }
        }

        let result = self.attach_or_create(&mut replica).await;
        match &result {
            Ok(fresh) => debug!(replica = %name, fresh, "adopted replica"),
            Err(e) => replica.fail(e),
        }
        self.publish(&replica);
        result.context(|| replica.context("adopt replica"))
    }

    async fn attach_or_create(&self, replica: &mut Replica) -> Result<bool> {
        let live = bounded(
            "probe bdev",
            self.op_timeout,
            self.driver.lookup_bdev(replica.name.as_str()),
        )
        .await?;
        if let Some(handle) = live {
            if handle.path == replica.path {
                replica.attach(handle);
                return Ok(false);
            }
        }

        match self.open_with_retry(replica).await {
            Ok(handle) => {
                replica.attach(handle);
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                let spec = BackingSpec {
                    name: replica.name.clone(),
                    path: replica.path.clone(),
                    size_bytes: replica.size_bytes,
                };
                let handle = bounded(
                    "create backing store",
                    self.op_timeout,
                    self.driver.create_backing_store(&spec),
                )
                .await?;
                warn!(replica = %replica.name, "backing store was missing, allocated a fresh one");
                replica.attach(handle);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn open_with_retry(&self, replica: &Replica) -> Result<BdevHandle> {
        let driver = &self.driver;
        let (name, path) = (&replica.name, &replica.path);
        self.open_retry
            .run("open replica", move |_| {
                bounded("open replica", self.op_timeout, driver.open(name, path))
            })
            .await
    }

    /// Open the bdev of a closed replica. Opening an open replica is a no-op.
    pub async fn open(&self, name: &str) -> Result<()> {
        let entry = self.get(name)?;
        let mut replica = entry.lock().await;
        self.open_locked(&mut replica).await
    }

    pub async fn open_locked(&self, replica: &mut Replica) -> Result<()> {
        match replica.state {
            ReplicaState::Open => return Ok(()),
            ReplicaState::Deleting | ReplicaState::Creating => {
                return Err(Error::Conflict(format!(
                    "replica {} is {:?}",
                    replica.name, replica.state
                ))
                .with_context(replica.context("open replica")));
            }
            ReplicaState::Closed | ReplicaState::Error => {}
        }
        let result = self.open_with_retry(replica).await;
        match &result {
            Ok(handle) => replica.attach(handle.clone()),
            Err(e) => replica.fail(e),
        }
        self.publish(replica);
        result
            .map(|_| ())
            .context(|| replica.context("open replica"))
    }

    /// Detach a replica's bdev. Closing a closed replica is a no-op.
    pub async fn close(&self, name: &str) -> Result<()> {
        let entry = self.get(name)?;
        let mut replica = entry.lock().await;
        self.close_locked(&mut replica).await
    }

    pub async fn close_locked(&self, replica: &mut Replica) -> Result<()> {
        if replica.constituent {
            return Err(Error::Busy(format!(
                "replica {} is a RAID constituent",
                replica.name
            ))
            .with_context(replica.context("close replica")));
        }
        if let Some(handle) = replica.bdev.clone() {
            bounded("close replica", self.op_timeout, self.driver.close(&handle))
                .await
                .context(|| replica.context("close replica"))?;
        }
        replica.bdev = None;
        if replica.state != ReplicaState::Deleting {
            replica.set_state(ReplicaState::Closed);
        }
        self.publish(replica);
        Ok(())
    }

    /// Close and remove a replica, including its backing store
    pub async fn delete(&self, name: &str) -> Result<()> {
        let entry = self.get(name)?;
        let mut replica = entry.lock().await;
        self.delete_locked(&mut replica).await
    }

    pub async fn delete_locked(&self, replica: &mut Replica) -> Result<()> {
        self.close_locked(replica).await?;
        replica.set_state(ReplicaState::Deleting);
        self.publish(replica);

        let path = replica.path.clone();
        if let Err(e) = bounded(
            "delete backing store",
            self.op_timeout,
            self.driver.delete_backing_store(&path),
        )
        .await
        {
            replica.fail(&e);
            self.publish(replica);
            return Err(e.with_context(replica.context("delete replica")));
        }
        self.remove_record(&replica.name);
        info!(replica = %replica.name, "deleted replica");
        Ok(())
    }

    /// Point-in-time copy of an open replica
    pub async fn snapshot_locked(&self, replica: &Replica, snapshot: &str) -> Result<SnapshotRef> {
        let handle = replica.handle()?;
        bounded(
            "snapshot replica",
            self.op_timeout,
            self.driver.snapshot(handle, snapshot),
        )
        .await
        .context(|| replica.context("snapshot replica"))
    }

    /// Flag a replica as a RAID constituent. It must be open.
    pub fn mark_constituent(&self, replica: &mut Replica) -> Result<()> {
        replica.handle()?;
        replica.constituent = true;
        Ok(())
    }

    pub fn clear_constituent(&self, replica: &mut Replica) {
        replica.constituent = false;
    }

    /// Drop the in-memory record without touching storage
    pub fn forget(&self, name: &ReplicaName) {
        self.remove_record(name);
    }
}
