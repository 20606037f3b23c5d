//! Request façade
//!
//! Thin JSON request/response layer in front of the engine registry. One
//! request maps to one registry operation; errors come back as a
//! classified [`ErrorInfo`], never as a transport failure.

use std::sync::Arc;

use raidvol_common::{
    Error, FrontendType, RaidLevel, ReplicaAddress, ReplicaName, Result, VolumeId, VolumeSpec,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::SnapshotRef;
use crate::engine::{EngineStatus, ErrorInfo};
use crate::registry::EngineRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateEngine {
        volume_id: String,
        replica_addresses: Vec<String>,
        raid_level: String,
        #[serde(default)]
        frontend_type: FrontendType,
        /// Falls back to the configured default size
        #[serde(default)]
        size_bytes: Option<u64>,
    },
    AddReplica {
        volume_id: String,
        replica_address: String,
    },
    RemoveReplica {
        volume_id: String,
        replica_name: String,
    },
    DeleteEngine {
        volume_id: String,
    },
    GetStatus {
        volume_id: String,
    },
    SuspendEngine {
        volume_id: String,
    },
    ResumeEngine {
        volume_id: String,
    },
    RecreateEngine {
        volume_id: String,
    },
    ListEngines,
    SnapshotReplica {
        volume_id: String,
        replica_name: String,
        snapshot_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Status(EngineStatus),
    Statuses { engines: Vec<EngineStatus> },
    Snapshot(SnapshotRef),
    Error(ErrorInfo),
}

impl Response {
    fn status(status: &Arc<EngineStatus>) -> Self {
        Self::Status(EngineStatus::clone(status))
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Self::Error(ErrorInfo::from(&e))
    }
}

pub struct Facade {
    registry: Arc<EngineRegistry>,
    default_size: u64,
}

impl Facade {
    pub fn new(registry: Arc<EngineRegistry>, default_size: u64) -> Self {
        Self {
            registry,
            default_size,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!(?request, "handling request");
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => e.into(),
        }
    }

    /// Decode one JSON request, handle it and encode the response
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => Error::invalid_argument(format!("malformed request: {e}")).into(),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"result":"error","kind":"internal","message":"encode failed: {e}"}}"#)
        })
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        let registry = &self.registry;
        Ok(match request {
            Request::CreateEngine {
                volume_id,
                replica_addresses,
                raid_level,
                frontend_type,
                size_bytes,
            } => {
                let spec = VolumeSpec {
                    volume_id: VolumeId::new(volume_id)?,
                    replicas: replica_addresses
                        .into_iter()
                        .map(ReplicaAddress::new)
                        .collect(),
                    raid_level: raid_level.parse::<RaidLevel>()?,
                    frontend: frontend_type,
                    size_bytes: size_bytes.unwrap_or(self.default_size),
                };
                Response::status(&registry.create(spec).await?)
            }
            Request::AddReplica {
                volume_id,
                replica_address,
            } => Response::status(
                &registry
                    .add_replica(&VolumeId::new(volume_id)?, &ReplicaAddress::new(replica_address))
                    .await?,
            ),
            Request::RemoveReplica {
                volume_id,
                replica_name,
            } => Response::status(
                &registry
                    .remove_replica(&VolumeId::new(volume_id)?, &ReplicaName::new(replica_name)?)
                    .await?,
            ),
            Request::DeleteEngine { volume_id } => {
                registry.delete(&VolumeId::new(volume_id)?).await?;
                Response::Ack
            }
            Request::GetStatus { volume_id } => {
                Response::status(&registry.status(&VolumeId::new(volume_id)?)?)
            }
            Request::SuspendEngine { volume_id } => {
                Response::status(&registry.suspend(&VolumeId::new(volume_id)?).await?)
            }
            Request::ResumeEngine { volume_id } => {
                Response::status(&registry.resume(&VolumeId::new(volume_id)?).await?)
            }
            Request::RecreateEngine { volume_id } => {
                Response::status(&registry.recreate(&VolumeId::new(volume_id)?).await?)
            }
            Request::ListEngines => Response::Statuses {
                engines: registry
                    .list()
                    .iter()
                    .map(|s| EngineStatus::clone(s))
                    .collect(),
            },
            Request::SnapshotReplica {
                volume_id,
                replica_name,
                snapshot_name,
            } => Response::Snapshot(
                registry
                    .snapshot_replica(
                        &VolumeId::new(volume_id)?,
                        &ReplicaName::new(replica_name)?,
                        &snapshot_name,
                    )
                    .await?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineDeps;
    use crate::local::LocalDataPlane;
    use crate::raid::RaidState;
    use raidvol_common::config::EngineConfig;
    use raidvol_common::{Config, ErrorKind};
    use raidvol_meta_store::MemoryStore;
    use tempfile::{TempDir, tempdir};

    fn facade() -> (TempDir, Facade) {
        let dir = tempdir().unwrap();
        let config = Arc::new(Config {
            engine: EngineConfig {
                op_timeout_ms: 200,
                backoff_base_ms: 1,
                sync_poll_interval_ms: 1,
                ..EngineConfig::default()
            },
            ..Config::default()
        });
        let plane = Arc::new(LocalDataPlane::new(dir.path(), config.frontend.clone()));
        let registry = Arc::new(EngineRegistry::new(EngineDeps {
            driver: plane.clone(),
            plane,
            store: Arc::new(MemoryStore::new()),
            config,
        }));
        (dir, Facade::new(registry, 1024 * 1024))
    }

    fn status_of(response: Response) -> EngineStatus {
        match response {
            Response::Status(status) => status,
            other => panic!("expected status, got {other:?}"),
        }
    }

    fn error_kind(response: Response) -> ErrorKind {
        match response {
            Response::Error(info) => info.kind,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_then_remove_scenario() {
        let (_dir, facade) = facade();

        let created = status_of(
            facade
                .handle(Request::CreateEngine {
                    volume_id: "vol1".to_string(),
                    replica_addresses: vec!["r1".into(), "r2".into(), "r3".into()],
                    raid_level: "1".to_string(),
                    frontend_type: FrontendType::Nvmf,
                    size_bytes: None,
                })
                .await,
        );
        assert_eq!(created.state, RaidState::Healthy);
        assert_eq!(created.constituents, vec!["r1", "r2", "r3"]);
        assert_eq!(created.size_bytes, 1024 * 1024);

        let removed = status_of(
            facade
                .handle(Request::RemoveReplica {
                    volume_id: "vol1".to_string(),
                    replica_name: "r2".to_string(),
                })
                .await,
        );
        assert_eq!(removed.constituents, vec!["r1", "r3"]);
        let tail: Vec<_> = removed.history.iter().rev().take(3).map(|t| t.to).collect();
        assert_eq!(
            tail,
            vec![RaidState::Healthy, RaidState::Rebuilding, RaidState::Degraded]
        );

        let again = facade
            .handle(Request::RemoveReplica {
                volume_id: "vol1".to_string(),
                replica_name: "r2".to_string(),
            })
            .await;
        assert_eq!(error_kind(again), ErrorKind::ConstituentMismatch);
    }

    #[tokio::test]
    async fn test_json_lines() {
        let (_dir, facade) = facade();

        let line = r#"{"op":"create_engine","volume_id":"v1","replica_addresses":["a","b"],"raid_level":"raid1"}"#;
        let response: serde_json::Value =
            serde_json::from_str(&facade.handle_line(line).await).unwrap();
        assert_eq!(response["result"], "status");
        assert_eq!(response["state"], "healthy");
        assert_eq!(response["frontend"], "none");

        let response: serde_json::Value =
            serde_json::from_str(&facade.handle_line(r#"{"op":"list_engines"}"#).await).unwrap();
        assert_eq!(response["result"], "statuses");
        assert_eq!(response["engines"].as_array().unwrap().len(), 1);

        let response: serde_json::Value =
            serde_json::from_str(&facade.handle_line("{not json").await).unwrap();
        assert_eq!(response["result"], "error");
        assert_eq!(response["kind"], "invalid_argument");

        let response: serde_json::Value = serde_json::from_str(
            &facade
                .handle_line(r#"{"op":"get_status","volume_id":"missing"}"#)
                .await,
        )
        .unwrap();
        assert_eq!(response["kind"], "not_found");

        let response: serde_json::Value = serde_json::from_str(
            &facade
                .handle_line(r#"{"op":"delete_engine","volume_id":"v1"}"#)
                .await,
        )
        .unwrap();
        assert_eq!(response["result"], "ack");
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (_dir, facade) = facade();

        let bad_level = facade
            .handle(Request::CreateEngine {
                volume_id: "v1".to_string(),
                replica_addresses: vec!["a".into()],
                raid_level: "raid6".to_string(),
                frontend_type: FrontendType::None,
                size_bytes: None,
            })
            .await;
        assert_eq!(error_kind(bad_level), ErrorKind::InvalidArgument);

        let bad_id = facade
            .handle(Request::GetStatus {
                volume_id: "no/slashes".to_string(),
            })
            .await;
        assert_eq!(error_kind(bad_id), ErrorKind::InvalidArgument);

        let too_few = facade
            .handle(Request::CreateEngine {
                volume_id: "v1".to_string(),
                replica_addresses: vec!["a".into(), "b".into()],
                raid_level: "raid5f".to_string(),
                frontend_type: FrontendType::None,
                size_bytes: None,
            })
            .await;
        assert_eq!(error_kind(too_few), ErrorKind::InvalidArgument);
    }
}
