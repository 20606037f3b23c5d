//! Configuration types for raidvol
//!
//! Every timeout, retry bound and backoff constant used by the engine is a
//! field here with a documented default. Files are TOML; missing sections
//! and fields fall back to the defaults.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for raidvol
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub frontend: FrontendConfig,
    pub logging: LoggingConfig,
}

/// Timeouts, retry bounds and reconciliation cadence
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for a single driver or data-plane call (milliseconds)
    pub op_timeout_ms: u64,
    /// Maximum RAID create/adjust attempts before the array is Failed
    pub assembly_max_attempts: u32,
    /// First backoff delay between attempts (milliseconds)
    pub backoff_base_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub backoff_max_ms: u64,
    /// Random jitter applied to each delay, as a fraction (0.0 - 1.0)
    pub backoff_jitter: f64,
    /// How often rebuild progress is polled (milliseconds)
    pub sync_poll_interval_ms: u64,
    /// Sync errors tolerated during one rebuild before the array is Failed
    pub sync_error_budget: u32,
    /// Upper bound on a whole rebuild (milliseconds)
    pub sync_timeout_ms: u64,
    /// Period of the background reconciliation pass (seconds, 0 = disabled)
    pub reconcile_interval_secs: u64,
    /// RAID state transitions kept per engine for status reporting
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: 5_000,
            assembly_max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            backoff_jitter: 0.1,
            sync_poll_interval_ms: 100,
            sync_error_budget: 3,
            sync_timeout_ms: 10 * 60 * 1_000, // 10 minutes
            reconcile_interval_secs: 30,
            history_limit: 32,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    #[must_use]
    pub const fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    #[must_use]
    pub const fn reconcile_interval(&self) -> Option<Duration> {
        if self.reconcile_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.reconcile_interval_secs))
        }
    }

    /// Retry policy for RAID assembly and adjustment
    #[must_use]
    pub fn assembly_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.assembly_max_attempts,
            Duration::from_millis(self.backoff_base_ms),
        )
        .with_max_delay(Duration::from_millis(self.backoff_max_ms))
        .with_jitter(self.backoff_jitter)
    }
}

/// Where replica backing stores and the metadata database live
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory for the metadata database
    pub data_dir: PathBuf,
    /// Directory relative replica addresses are resolved against
    pub replica_dir: PathBuf,
    /// Size used when a create request does not carry one
    pub default_volume_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/raidvol"),
            replica_dir: PathBuf::from("/var/lib/raidvol/replicas"),
            default_volume_size: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

/// How assembled volumes are advertised
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub advertise_host: String,
    pub nvmf_port: u16,
    pub nqn_prefix: String,
    /// Directory block device nodes are published under
    pub blockdev_dir: PathBuf,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            nvmf_port: 4420,
            nqn_prefix: "nqn.2024-01.io.raidvol".to_string(),
            blockdev_dir: PathBuf::from("/dev/raidvol"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.assembly_max_attempts, 5);
        assert_eq!(config.engine.op_timeout(), Duration::from_secs(5));
        assert_eq!(config.frontend.nvmf_port, 4420);
        assert_eq!(config.engine.assembly_retry().max_attempts(), 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            assembly_max_attempts = 2
            reconcile_interval_secs = 0

            [storage]
            replica_dir = "/tmp/replicas"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.assembly_max_attempts, 2);
        assert_eq!(config.engine.op_timeout_ms, 5_000);
        assert!(config.engine.reconcile_interval().is_none());
        assert_eq!(config.storage.replica_dir, PathBuf::from("/tmp/replicas"));
        assert_eq!(config.logging.level, "info");
    }
}
