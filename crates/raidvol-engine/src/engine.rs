//! Engine controller
//!
//! One [`Engine`] per volume. It owns the volume's replicas and RAID bdev and
//! serializes every structural change behind a single async lock. Lock order
//! is always: engine lock, then replica locks in name order, then driver.
//!
//! Status reads never take the engine lock: after each operation a fresh
//! [`EngineStatus`] snapshot is published.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use raidvol_common::{
    Config, Error, ErrorKind, FrontendType, OpContext, RaidLevel, ReplicaAddress, ReplicaName,
    Result, VolumeId, VolumeSpec,
};
use raidvol_meta_store::VolumeSpecStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dataplane::RaidPlane;
use crate::driver::{DiskDriver, SnapshotRef};
use crate::raid::{RaidBdev, RaidState, RaidTransition, Reconciler};
use crate::replica::{ReplicaManager, ReplicaState};

/// Collaborators shared by every engine
#[derive(Clone)]
pub struct EngineDeps {
    pub driver: Arc<dyn DiskDriver>,
    pub plane: Arc<dyn RaidPlane>,
    pub store: Arc<dyn VolumeSpecStore>,
    pub config: Arc<Config>,
}

/// Error as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorInfo {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Point-in-time view of one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub volume_id: VolumeId,
    pub state: RaidState,
    pub endpoint: Option<String>,
    pub replica_states: BTreeMap<String, ReplicaState>,
    /// RAID constituents in array order
    pub constituents: Vec<String>,
    pub raid_level: RaidLevel,
    pub frontend: FrontendType,
    pub size_bytes: u64,
    pub suspended: bool,
    pub last_error: Option<ErrorInfo>,
    pub history: Vec<RaidTransition>,
}

struct EngineInner {
    spec: VolumeSpec,
    raid: RaidBdev,
    suspended: bool,
    endpoint: Option<String>,
    last_error: Option<ErrorInfo>,
    /// The current spec has been written to the metadata store
    persisted: bool,
    deleted: bool,
}

pub struct Engine {
    volume_id: VolumeId,
    deps: EngineDeps,
    reconciler: Reconciler,
    replicas: ReplicaManager,
    inner: Mutex<EngineInner>,
    status: RwLock<Arc<EngineStatus>>,
}

impl Engine {
    /// Build an engine for `spec`. No I/O happens until an operation runs.
    ///
    /// `persisted` says whether `spec` is already in the metadata store.
    pub fn new(spec: VolumeSpec, persisted: bool, deps: EngineDeps) -> Self {
        let engine_config = &deps.config.engine;
        let reconciler = Reconciler::new(Arc::clone(&deps.plane), engine_config);
        let replicas = ReplicaManager::new(
            Arc::clone(&deps.driver),
            engine_config.op_timeout(),
            engine_config.assembly_retry(),
        );
        let raid = RaidBdev::new(
            spec.volume_id.to_string(),
            spec.raid_level,
            engine_config.history_limit,
        );
        let inner = EngineInner {
            spec,
            raid,
            suspended: false,
            endpoint: None,
            last_error: None,
            persisted,
            deleted: false,
        };
        let status = Arc::new(Self::snapshot(&inner, &replicas));
        Self {
            volume_id: inner.spec.volume_id.clone(),
            deps,
            reconciler,
            replicas,
            inner: Mutex::new(inner),
            status: RwLock::new(status),
        }
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.volume_id
    }

    /// Latest published status
    pub fn status(&self) -> Arc<EngineStatus> {
        Arc::clone(&self.status.read())
    }

    fn snapshot(inner: &EngineInner, replicas: &ReplicaManager) -> EngineStatus {
        EngineStatus {
            volume_id: inner.spec.volume_id.clone(),
            state: inner.raid.state,
            endpoint: inner.endpoint.clone(),
            replica_states: replicas.states(),
            constituents: inner.raid.member_names(),
            raid_level: inner.spec.raid_level,
            frontend: inner.spec.frontend,
            size_bytes: inner.spec.size_bytes,
            suspended: inner.suspended,
            last_error: inner.last_error.clone(),
            history: inner.raid.history.iter().cloned().collect(),
        }
    }

    fn publish(&self, inner: &EngineInner) {
        *self.status.write() = Arc::new(Self::snapshot(inner, &self.replicas));
    }

    fn context(&self, operation: &'static str) -> OpContext {
        OpContext::new(operation).volume(&self.volume_id)
    }

    /// Record the outcome of an operation and publish status
    fn finish<T>(&self, inner: &mut EngineInner, operation: &'static str, result: Result<T>) -> Result<T> {
        let result = result.map_err(|e| e.with_context(self.context(operation)));
        match &result {
            Ok(_) => {
                if inner.raid.state != RaidState::Failed {
                    inner.last_error = None;
                }
            }
            Err(e) => {
                if matches!(
                    e.kind(),
                    ErrorKind::TransientIo
                        | ErrorKind::AssemblyTimeout
                        | ErrorKind::Unrecoverable
                        | ErrorKind::Internal
                ) {
                    inner.last_error = Some(ErrorInfo::from(e));
                }
                warn!(volume_id = %self.volume_id, kind = %e.kind(), "{e}");
            }
        }
        self.publish(inner);
        result
    }

    fn check_live(&self, inner: &EngineInner) -> Result<()> {
        if inner.deleted {
            return Err(Error::not_found(format!("volume {}", self.volume_id)));
        }
        Ok(())
    }

    fn check_mutable(&self, inner: &EngineInner) -> Result<()> {
        self.check_live(inner)?;
        if inner.suspended {
            return Err(Error::Conflict(format!(
                "volume {} is suspended",
                self.volume_id
            )));
        }
        Ok(())
    }

    /// Provision replicas, assemble the RAID bdev and persist the volume spec.
    ///
    /// If a replica cannot be provisioned, the ones already created are
    /// removed again. If assembly fails the replicas are kept and the engine
    /// is left `Failed`.
    pub async fn create(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.create_locked(&mut inner).await;
        self.finish(&mut inner, "create engine", result)
    }

    async fn create_locked(&self, inner: &mut EngineInner) -> Result<()> {
        self.check_live(inner)?;
        inner.spec.validate()?;
        let spec = inner.spec.clone();

        let mut created = Vec::with_capacity(spec.replicas.len());
        for address in &spec.replicas {
            match self.replicas.create(address, spec.size_bytes).await {
                Ok(name) => {
                    created.push(name);
                    self.publish(inner);
                }
                Err(e) => {
                    self.discard_replicas(&created).await;
                    return Err(e);
                }
            }
        }

        let members = spec.replica_names()?;
        self.reconciler.assemble(&mut inner.raid, &members, &[]).await?;
        self.sync_constituents(&inner.raid).await?;
        self.expose_locked(inner).await?;
        self.persist_locked(inner)?;
        info!(volume_id = %self.volume_id, level = %spec.raid_level, replicas = members.len(), "engine created");
        Ok(())
    }

    async fn discard_replicas(&self, names: &[ReplicaName]) {
        for name in names {
            if let Err(e) = self.replicas.delete(name.as_str()).await {
                warn!(volume_id = %self.volume_id, replica = %name, "rollback failed: {e}");
            }
        }
    }

    /// Align every replica's constituent flag with the RAID record
    async fn sync_constituents(&self, raid: &RaidBdev) -> Result<()> {
        let names = self.replicas.list();
        let mut guards = self.replicas.lock_many(&names).await?;
        for replica in &mut guards {
            if raid.is_constituent(replica.name.as_str()) {
                self.replicas.mark_constituent(replica)?;
            } else {
                self.replicas.clear_constituent(replica);
            }
        }
        Ok(())
    }

    async fn expose_locked(&self, inner: &mut EngineInner) -> Result<()> {
        if inner.spec.frontend == FrontendType::None || !inner.raid.state.is_assembled() {
            inner.endpoint = None;
            return Ok(());
        }
        let endpoint = self
            .reconciler
            .expose(&inner.raid, inner.spec.frontend)
            .await?;
        if inner.endpoint.as_deref() != Some(endpoint.as_str()) {
            info!(volume_id = %self.volume_id, %endpoint, "volume exposed");
        }
        inner.endpoint = Some(endpoint);
        Ok(())
    }

    fn persist_locked(&self, inner: &mut EngineInner) -> Result<()> {
        inner.persisted = false;
        self.deps.store.put(&inner.spec)?;
        inner.persisted = true;
        Ok(())
    }

    /// Provision a new replica and add it to the array.
    ///
    /// Only allowed while the array is healthy and the engine is not
    /// suspended. The spec is persisted once the rebuild has finished.
    pub async fn add_replica(&self, address: &ReplicaAddress) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.add_replica_locked(&mut inner, address).await;
        self.finish(&mut inner, "add replica", result)
    }

    async fn add_replica_locked(&self, inner: &mut EngineInner, address: &ReplicaAddress) -> Result<()> {
        self.check_mutable(inner)?;
        let name = address.name()?;
        if inner.spec.address_of(name.as_str()).is_some() || self.replicas.contains(name.as_str()) {
            return Err(Error::already_exists(format!(
                "replica {name} in volume {}",
                self.volume_id
            )));
        }
        if !inner.spec.raid_level.is_redundant() {
            return Err(Error::invalid_argument(format!(
                "{} volumes cannot grow",
                inner.spec.raid_level
            )));
        }
        if inner.raid.state != RaidState::Healthy {
            return Err(Error::Conflict(format!(
                "volume {} is {:?}",
                self.volume_id, inner.raid.state
            )));
        }

        let mut order = inner.spec.replica_names()?;
        order.push(name.clone());
        self.replicas.create(address, inner.spec.size_bytes).await?;
        self.publish(inner);
        if let Err(e) = self
            .reconciler
            .add_constituent(&mut inner.raid, &name, &order)
            .await
        {
            if !inner.raid.is_constituent(name.as_str()) {
                self.discard_replicas(std::slice::from_ref(&name)).await;
            }
            self.sync_constituents(&inner.raid).await?;
            return Err(e);
        }
        self.sync_constituents(&inner.raid).await?;

        inner.spec.replicas.push(address.clone());
        self.persist_locked(inner)?;
        info!(volume_id = %self.volume_id, replica = %name, "replica added");
        Ok(())
    }

    /// Remove a constituent from the array and delete its replica.
    ///
    /// A replica that is not a constituent is a `ConstituentMismatch` and
    /// nothing changes.
    pub async fn remove_replica(&self, replica: &ReplicaName) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.remove_replica_locked(&mut inner, replica).await;
        self.finish(&mut inner, "remove replica", result)
    }

    async fn remove_replica_locked(&self, inner: &mut EngineInner, replica: &ReplicaName) -> Result<()> {
        self.check_mutable(inner)?;
        if !inner.raid.is_constituent(replica.as_str()) {
            return Err(Error::mismatch(format!(
                "{replica} is not a constituent of {}",
                self.volume_id
            )));
        }
        if !inner.raid.state.is_assembled() {
            return Err(Error::Conflict(format!(
                "volume {} is {:?}",
                self.volume_id, inner.raid.state
            )));
        }

        let removed = self
            .reconciler
            .remove_constituent(&mut inner.raid, replica)
            .await;
        self.sync_constituents(&inner.raid).await?;
        removed?;

        inner
            .spec
            .replicas
            .retain(|a| a.name().ok().as_ref() != Some(replica));
        if let Err(e) = self.replicas.delete(replica.as_str()).await {
            warn!(volume_id = %self.volume_id, replica = %replica, "removed replica was not deleted: {e}");
        }
        self.persist_locked(inner)?;
        info!(volume_id = %self.volume_id, replica = %replica, "replica removed");
        Ok(())
    }

    /// Stop I/O and structural changes. Suspending twice is a no-op.
    pub async fn suspend(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.suspend_locked(&mut inner).await;
        self.finish(&mut inner, "suspend engine", result)
    }

    async fn suspend_locked(&self, inner: &mut EngineInner) -> Result<()> {
        self.check_live(inner)?;
        if inner.suspended {
            return Ok(());
        }
        if inner.raid.state.is_assembled() {
            self.reconciler.quiesce(&inner.raid).await?;
        }
        inner.suspended = true;
        info!(volume_id = %self.volume_id, "engine suspended");
        Ok(())
    }

    /// Undo [`Engine::suspend`]. Resuming a running engine is a no-op.
    pub async fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.resume_locked(&mut inner).await;
        self.finish(&mut inner, "resume engine", result)
    }

    async fn resume_locked(&self, inner: &mut EngineInner) -> Result<()> {
        self.check_live(inner)?;
        if !inner.suspended {
            return Ok(());
        }
        if inner.raid.state.is_assembled() {
            self.reconciler.resume(&inner.raid).await?;
        }
        inner.suspended = false;
        info!(volume_id = %self.volume_id, "engine resumed");
        Ok(())
    }

    /// Tear down the array, delete every replica and drop the stored volume spec
    pub async fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.delete_locked(&mut inner).await;
        self.finish(&mut inner, "delete engine", result)
    }

    async fn delete_locked(&self, inner: &mut EngineInner) -> Result<()> {
        self.check_live(inner)?;
        self.reconciler.teardown(&mut inner.raid).await?;
        inner.endpoint = None;
        self.sync_constituents(&inner.raid).await?;

        let names = self.replicas.list();
        let mut guards = self.replicas.lock_many(&names).await?;
        for replica in &mut guards {
            self.replicas.delete_locked(replica).await?;
        }
        drop(guards);

        self.deps.store.delete(&self.volume_id)?;
        inner.persisted = false;
        inner.deleted = true;
        info!(volume_id = %self.volume_id, "engine deleted");
        Ok(())
    }

    /// Release the engine from memory only.
    ///
    /// The array, bdevs, backing stores and stored spec stay where they are
    /// so the next process can adopt them. Every later operation on this
    /// engine reports `NotFound`.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.deleted {
            return;
        }
        for name in self.replicas.list() {
            self.replicas.forget(&name);
        }
        inner.deleted = true;
        self.publish(&inner);
        debug!(volume_id = %self.volume_id, "engine released");
    }

    /// Converge on the volume spec: attach replicas, assemble or repair the
    /// array and expose it. Suspended and failed engines are left alone.
    pub async fn reconcile(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.reconcile_locked(&mut inner).await;
        self.finish(&mut inner, "reconcile engine", result)
    }

    async fn reconcile_locked(&self, inner: &mut EngineInner) -> Result<()> {
        self.check_live(inner)?;
        if inner.suspended {
            debug!(volume_id = %self.volume_id, "skipping reconcile of suspended engine");
            return Ok(());
        }
        if inner.raid.state == RaidState::Failed {
            debug!(volume_id = %self.volume_id, "skipping reconcile of failed engine");
            return Ok(());
        }

        let spec = inner.spec.clone();
        let desired = spec.replica_names()?;
        let mut fresh = BTreeSet::new();
        for (address, name) in spec.replicas.iter().zip(&desired) {
            let replica_is_fresh = self.replicas.adopt(address, spec.size_bytes).await;
            self.publish(inner);
            if replica_is_fresh? {
                fresh.insert(name.clone());
            }
        }

        let reconciled = self
            .reconciler
            .reconcile(&mut inner.raid, &desired, &fresh)
            .await;
        self.sync_constituents(&inner.raid).await?;
        reconciled?;

        for name in self.replicas.list() {
            if desired.contains(&name) || inner.raid.is_constituent(name.as_str()) {
                continue;
            }
            match self.replicas.delete(name.as_str()).await {
                Ok(()) => info!(volume_id = %self.volume_id, replica = %name, "deleted replica outside the volume spec"),
                Err(e) => warn!(volume_id = %self.volume_id, replica = %name, "stray replica was not deleted: {e}"),
            }
            self.publish(inner);
        }

        self.expose_locked(inner).await?;
        if !inner.persisted {
            self.persist_locked(inner)?;
        }
        Ok(())
    }

    /// Rebuild a failed array from scratch using the stored spec
    pub async fn recreate(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.recreate_locked(&mut inner).await;
        self.finish(&mut inner, "recreate engine", result)
    }

    async fn recreate_locked(&self, inner: &mut EngineInner) -> Result<()> {
        self.check_mutable(inner)?;
        if inner.raid.state != RaidState::Failed {
            return Err(Error::Conflict(format!(
                "volume {} is {:?}, only failed volumes can be recreated",
                self.volume_id, inner.raid.state
            )));
        }
        self.reconciler.teardown(&mut inner.raid).await?;
        inner.endpoint = None;
        info!(volume_id = %self.volume_id, "recreating engine");
        self.reconcile_locked(inner).await
    }

    /// Point-in-time copy of one replica, taken with I/O quiesced
    pub async fn snapshot_replica(&self, replica: &ReplicaName, snapshot: &str) -> Result<SnapshotRef> {
        let mut inner = self.inner.lock().await;
        let result = self.snapshot_replica_locked(&inner, replica, snapshot).await;
        self.finish(&mut inner, "snapshot replica", result)
    }

    async fn snapshot_replica_locked(
        &self,
        inner: &EngineInner,
        replica: &ReplicaName,
        snapshot: &str,
    ) -> Result<SnapshotRef> {
        self.check_live(inner)?;
        if inner.spec.address_of(replica.as_str()).is_none() {
            return Err(Error::not_found(format!(
                "replica {replica} in volume {}",
                self.volume_id
            )));
        }
        ReplicaName::new(snapshot)?;

        let quiesce = inner.raid.state.is_assembled() && !inner.suspended;
        if quiesce {
            self.reconciler.quiesce(&inner.raid).await?;
        }
        let taken = {
            let entry = self.replicas.get(replica.as_str())?;
            let guard = entry.lock().await;
            self.replicas.snapshot_locked(&guard, snapshot).await
        };
        if quiesce {
            self.reconciler.resume(&inner.raid).await?;
        }
        let taken = taken?;
        info!(volume_id = %self.volume_id, replica = %replica, snapshot, "replica snapshot taken");
        Ok(taken)
    }
}
