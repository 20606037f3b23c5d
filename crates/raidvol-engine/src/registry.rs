//! Engine registry
//!
//! Maps volume ids to engines, recovers every stored volume at startup and
//! runs the periodic reconciliation pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use raidvol_common::{Error, ReplicaAddress, ReplicaName, Result, VolumeId, VolumeSpec};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::driver::SnapshotRef;
use crate::engine::{Engine, EngineDeps, EngineStatus};
use crate::raid::RaidState;

pub struct EngineRegistry {
    deps: EngineDeps,
    engines: RwLock<HashMap<VolumeId, Arc<Engine>>>,
}

impl EngineRegistry {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Load every stored volume spec and reconcile it.
    ///
    /// Volumes that fail to come back stay registered with their error in
    /// status. Returns the number of volumes that reconciled cleanly.
    pub async fn start(&self) -> Result<usize> {
        let specs = self.deps.store.list()?;
        info!("Recovering {} volume(s) from metadata", specs.len());

        let mut recovered = 0;
        for spec in specs {
            let engine = Arc::new(Engine::new(spec, true, self.deps.clone()));
            self.engines
                .write()
                .insert(engine.volume_id().clone(), Arc::clone(&engine));
            match engine.reconcile().await {
                Ok(()) => recovered += 1,
                Err(e) => error!("Failed to recover volume {}: {e}", engine.volume_id()),
            }
        }
        Ok(recovered)
    }

    pub fn get(&self, volume_id: &VolumeId) -> Result<Arc<Engine>> {
        self.engines
            .read()
            .get(volume_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("volume {volume_id}")))
    }

    /// Register and create a new engine.
    ///
    /// If creation fails before anything was provisioned the engine is
    /// unregistered. Once replicas or an array exist it stays registered, so
    /// reconcile can finish the job or a failed array can be recreated.
    pub async fn create(&self, spec: VolumeSpec) -> Result<Arc<EngineStatus>> {
        spec.validate()?;
        let engine = {
            let mut engines = self.engines.write();
            if engines.contains_key(&spec.volume_id) {
                return Err(Error::already_exists(format!("volume {}", spec.volume_id)));
            }
            let engine = Arc::new(Engine::new(spec, false, self.deps.clone()));
            engines.insert(engine.volume_id().clone(), Arc::clone(&engine));
            engine
        };

        match engine.create().await {
            Ok(()) => Ok(engine.status()),
            Err(e) => {
                let status = engine.status();
                if status.state == RaidState::Absent && status.replica_states.is_empty() {
                    self.engines.write().remove(engine.volume_id());
                }
                Err(e)
            }
        }
    }

    pub async fn add_replica(&self, volume_id: &VolumeId, address: &ReplicaAddress) -> Result<Arc<EngineStatus>> {
        let engine = self.get(volume_id)?;
        engine.add_replica(address).await?;
        Ok(engine.status())
    }

    pub async fn remove_replica(&self, volume_id: &VolumeId, replica: &ReplicaName) -> Result<Arc<EngineStatus>> {
        let engine = self.get(volume_id)?;
        engine.remove_replica(replica).await?;
        Ok(engine.status())
    }

    pub async fn suspend(&self, volume_id: &VolumeId) -> Result<Arc<EngineStatus>> {
        let engine = self.get(volume_id)?;
        engine.suspend().await?;
        Ok(engine.status())
    }

    pub async fn resume(&self, volume_id: &VolumeId) -> Result<Arc<EngineStatus>> {
        let engine = self.get(volume_id)?;
        engine.resume().await?;
        Ok(engine.status())
    }

    pub async fn recreate(&self, volume_id: &VolumeId) -> Result<Arc<EngineStatus>> {
        let engine = self.get(volume_id)?;
        engine.recreate().await?;
        Ok(engine.status())
    }

    pub async fn snapshot_replica(
        &self,
        volume_id: &VolumeId,
        replica: &ReplicaName,
        snapshot: &str,
    ) -> Result<SnapshotRef> {
        self.get(volume_id)?
            .snapshot_replica(replica, snapshot)
            .await
    }

    pub async fn delete(&self, volume_id: &VolumeId) -> Result<()> {
        let engine = self.get(volume_id)?;
        engine.delete().await?;
        self.engines.write().remove(volume_id);
        Ok(())
    }

    pub fn status(&self, volume_id: &VolumeId) -> Result<Arc<EngineStatus>> {
        Ok(self.get(volume_id)?.status())
    }

    /// Status of every engine, sorted by volume id
    pub fn list(&self) -> Vec<Arc<EngineStatus>> {
        let mut statuses: Vec<_> = self.engines.read().values().map(|e| e.status()).collect();
        statuses.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        statuses
    }

    /// One reconciliation pass over every engine. Returns how many failed.
    pub async fn reconcile_all(&self) -> usize {
        let engines: Vec<Arc<Engine>> = self.engines.read().values().cloned().collect();
        let mut failed = 0;
        for engine in engines {
            if let Err(e) = engine.reconcile().await {
                warn!("Reconcile of volume {} failed: {e}", engine.volume_id());
                failed += 1;
            }
        }
        failed
    }

    /// Unregister every engine and release it from memory. Storage and the
    /// data plane are left untouched for the next [`EngineRegistry::start`].
    pub async fn shutdown(&self) {
        let engines: Vec<Arc<Engine>> = self.engines.write().drain().map(|(_, e)| e).collect();
        for engine in &engines {
            engine.shutdown().await;
        }
        info!("Engine registry shut down, released {} engine(s)", engines.len());
    }

    /// Run [`EngineRegistry::reconcile_all`] every `interval` until
    /// `shutdown` flips to `true`.
    pub fn spawn_reconcile_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already reconciled
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let failed = self.reconcile_all().await;
                        if failed > 0 {
                            warn!("Reconcile pass finished with {failed} failure(s)");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Reconcile loop stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalDataPlane;
    use raidvol_common::config::EngineConfig;
    use raidvol_common::{Config, ErrorKind, FrontendType, RaidLevel};
    use raidvol_meta_store::{MemoryStore, VolumeSpecStore};
    use tempfile::tempdir;

    fn deps(dir: &std::path::Path, store: Arc<MemoryStore>) -> (Arc<LocalDataPlane>, EngineDeps) {
        let config = Arc::new(Config {
            engine: EngineConfig {
                op_timeout_ms: 200,
                assembly_max_attempts: 2,
                backoff_base_ms: 1,
                backoff_jitter: 0.0,
                sync_poll_interval_ms: 1,
                ..EngineConfig::default()
            },
            ..Config::default()
        });
        let plane = Arc::new(LocalDataPlane::new(dir, config.frontend.clone()));
        let deps = EngineDeps {
            driver: plane.clone(),
            plane: plane.clone(),
            store,
            config,
        };
        (plane, deps)
    }

    fn spec(id: &str, replicas: &[&str]) -> VolumeSpec {
        VolumeSpec {
            volume_id: VolumeId::new(id).unwrap(),
            replicas: replicas.iter().map(|r| ReplicaAddress::from(*r)).collect(),
            raid_level: RaidLevel::Raid1,
            frontend: FrontendType::None,
            size_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let dir = tempdir().unwrap();
        let (_plane, deps) = deps(dir.path(), Arc::new(MemoryStore::new()));
        let registry = EngineRegistry::new(deps);

        registry.create(spec("v1", &["a1", "a2"])).await.unwrap();
        let err = registry.create(spec("v1", &["b1"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_provisioning_unregisters() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a2.img"), b"x").unwrap();
        let (_plane, deps) = deps(dir.path(), Arc::new(MemoryStore::new()));
        let registry = EngineRegistry::new(deps);

        registry.create(spec("v1", &["a1", "a2"])).await.unwrap_err();
        assert!(registry.get(&VolumeId::new("v1").unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_failed_metadata_write_keeps_engine_for_reconcile() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (plane, deps) = deps(dir.path(), Arc::clone(&store));
        let registry = EngineRegistry::new(deps);
        let id = VolumeId::new("v1").unwrap();

        store.set_fail_writes(true);
        let err = registry.create(spec("v1", &["a1", "a2"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        let status = registry.status(&id).unwrap();
        assert_eq!(status.state, RaidState::Healthy);
        assert!(status.last_error.is_some());
        assert_eq!(plane.raid_names(), vec!["v1"]);

        store.set_fail_writes(false);
        assert_eq!(registry.reconcile_all().await, 0);
        assert_eq!(store.list().unwrap().len(), 1);

        // The array is owned by the registered engine, not up for grabs
        let err = registry.create(spec("v1", &["a1", "a2"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(plane.create_raid_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_recovers_stored_volumes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        {
            let (_plane, deps) = deps(dir.path(), Arc::clone(&store));
            let registry = EngineRegistry::new(deps);
            registry.create(spec("v1", &["a1", "a2"])).await.unwrap();
            registry.create(spec("v2", &["b1", "b2", "b3"])).await.unwrap();
        }
        assert_eq!(store.list().unwrap().len(), 2);

        let (plane, deps) = deps(dir.path(), Arc::clone(&store));
        let registry = EngineRegistry::new(deps);
        assert_eq!(registry.start().await.unwrap(), 2);

        let statuses = registry.list();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == RaidState::Healthy));
        assert_eq!(statuses[1].constituents, vec!["b1", "b2", "b3"]);
        assert_eq!(plane.raid_names(), vec!["v1", "v2"]);

        registry.delete(&VolumeId::new("v1").unwrap()).await.unwrap();
        assert_eq!(registry.list().len(), 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_then_start_adopts_live_arrays() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (plane, deps) = deps(dir.path(), Arc::clone(&store));
        let registry = EngineRegistry::new(deps.clone());
        registry.create(spec("v1", &["a1", "a2"])).await.unwrap();

        registry.shutdown().await;
        assert!(registry.list().is_empty());
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(plane.raid_names(), vec!["v1"]);

        let registry = EngineRegistry::new(deps);
        assert_eq!(registry.start().await.unwrap(), 1);
        assert_eq!(registry.list()[0].state, RaidState::Healthy);
        assert_eq!(plane.create_raid_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_loop_repairs_and_stops() {
        let dir = tempdir().unwrap();
        let (plane, deps) = deps(dir.path(), Arc::new(MemoryStore::new()));
        let registry = Arc::new(EngineRegistry::new(deps));
        registry.create(spec("v1", &["a1", "a2"])).await.unwrap();

        plane.drop_raids();
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&registry).spawn_reconcile_loop(Duration::from_millis(20), rx);

        let id = VolumeId::new("v1").unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            // Healthy -> Absent -> Assembling -> Healthy on top of creation
            while registry.status(&id).unwrap().history.len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.status(&id).unwrap().state, RaidState::Healthy);
        assert_eq!(plane.raid_names(), vec!["v1"]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
