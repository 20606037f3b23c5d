//! Redb table definitions for persistent volume metadata.

use redb::TableDefinition;

/// Key: volume id, Value: bincode-encoded `StoredVolumeSpec`
pub const VOLUME_SPECS: TableDefinition<&str, &[u8]> = TableDefinition::new("volume_specs");
