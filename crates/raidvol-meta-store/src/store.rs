//! Persistent metadata store backed by redb.
//!
//! Every write is a single write transaction committed before returning, so
//! a put that returns `Ok` is durable. Decoding failures on load are logged
//! and the entry is skipped rather than failing the whole startup.

use crate::tables;
use crate::types::StoredVolumeSpec;
use crate::VolumeSpecStore;
use raidvol_common::{Error, Result, VolumeId, VolumeSpec};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::{debug, error};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        Self::Metadata(e.to_string())
    }
}

pub type MetaStoreResult<T> = std::result::Result<T, MetaStoreError>;

/// Persistent volume spec store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::VOLUME_SPECS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn put_record(&self, key: &str, record: &StoredVolumeSpec) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::VOLUME_SPECS)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_record(&self, key: &str) -> MetaStoreResult<Option<StoredVolumeSpec>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::VOLUME_SPECS)?;
        match table.get(key)? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    fn delete_record(&self, key: &str) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::VOLUME_SPECS)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_records(&self) -> MetaStoreResult<Vec<StoredVolumeSpec>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::VOLUME_SPECS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<StoredVolumeSpec>(entry.1.value()) {
                Ok(record) => result.push(record),
                Err(e) => error!("Failed to decode volume spec '{}': {}", key, e),
            }
        }
        Ok(result)
    }
}

impl VolumeSpecStore for MetaStore {
    fn get(&self, volume_id: &VolumeId) -> Result<VolumeSpec> {
        self.get_record(volume_id.as_str())?
            .map(|r| r.spec)
            .ok_or_else(|| Error::not_found(format!("volume spec {volume_id}")))
    }

    fn put(&self, spec: &VolumeSpec) -> Result<()> {
        self.put_record(spec.volume_id.as_str(), &StoredVolumeSpec::new(spec.clone()))?;
        debug!(volume_id = %spec.volume_id, replicas = spec.replicas.len(), "persisted volume spec");
        Ok(())
    }

    fn delete(&self, volume_id: &VolumeId) -> Result<()> {
        self.delete_record(volume_id.as_str())?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<VolumeSpec>> {
        Ok(self.load_records()?.into_iter().map(|r| r.spec).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raidvol_common::{FrontendType, RaidLevel, ReplicaAddress};
    use tempfile::tempdir;

    fn spec(id: &str, replicas: &[&str]) -> VolumeSpec {
        VolumeSpec {
            volume_id: VolumeId::new(id).unwrap(),
            replicas: replicas.iter().map(|r| ReplicaAddress::from(*r)).collect(),
            raid_level: RaidLevel::Raid1,
            frontend: FrontendType::Nvmf,
            size_bytes: 4 * 1024 * 1024,
        }
    }

    #[test]
    fn test_put_get_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("raidvol.db");

        {
            let store = MetaStore::open(&path).unwrap();
            store.put(&spec("v1", &["r1", "r2", "r3"])).unwrap();
            store.put(&spec("v2", &["a"])).unwrap();
        }

        let store = MetaStore::open(&path).unwrap();
        let v1 = store.get(&VolumeId::new("v1").unwrap()).unwrap();
        assert_eq!(v1, spec("v1", &["r1", "r2", "r3"]));

        let ids: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.volume_id.to_string())
            .collect();
        assert_eq!(ids, vec!["v1", "v2"]);
    }

    #[test]
    fn test_missing_and_delete() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("raidvol.db")).unwrap();
        let id = VolumeId::new("v1").unwrap();

        assert!(store.get(&id).unwrap_err().is_not_found());
        store.delete(&id).unwrap();

        store.put(&spec("v1", &["r1"])).unwrap();
        store.delete(&id).unwrap();
        assert!(store.get(&id).unwrap_err().is_not_found());
        assert!(store.list().unwrap().is_empty());
    }
}
