#![allow(clippy::result_large_err)]
//! raidvol Engine
//!
//! Assembles replicas into a RAID bdev and keeps it matched to the durable
//! volume spec. The data plane is treated as forgetful: after any restart the
//! engine re-derives the array from the stored volume spec and live probing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Facade      │  (JSON requests)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐      ┌──────────────┐
//! │ EngineRegistry  │─────▶│ VolumeSpec   │
//! │  - Engine       │      │ store (redb) │
//! │  - Reconciler   │      └──────────────┘
//! │  - ReplicaMgr   │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Data plane    │  (DiskDriver + RaidPlane)
//! └─────────────────┘
//! ```

pub mod dataplane;
pub mod deadline;
pub mod driver;
pub mod engine;
pub mod facade;
pub mod local;
pub mod raid;
pub mod registry;
pub mod replica;

pub use dataplane::{RaidInfo, RaidPlane, SyncStatus};
pub use driver::{BackingSpec, BdevHandle, DiskDriver, SnapshotRef};
pub use engine::{Engine, EngineDeps, EngineStatus, ErrorInfo};
pub use facade::{Facade, Request, Response};
pub use local::{FaultPlan, LocalDataPlane};
pub use raid::{RaidBdev, RaidState, RaidTransition, Reconciler};
pub use registry::EngineRegistry;
pub use replica::{Replica, ReplicaManager, ReplicaState};
