//! RAID reconciliation
//!
//! [`RaidBdev`] is a cache of what we last saw and did. Every decision starts
//! by observing the data plane and classifying the live array against the
//! desired constituent list.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use raidvol_common::config::EngineConfig;
use raidvol_common::{Error, ErrorKind, FrontendType, RaidLevel, ReplicaName, Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dataplane::{RaidInfo, RaidPlane, SyncStatus};
use crate::deadline::bounded;

/// RAID bdev state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidState {
    Absent,
    Assembling,
    Healthy,
    Degraded,
    Rebuilding,
    Failed,
}

impl RaidState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RaidState::{Absent, Assembling, Degraded, Failed, Healthy, Rebuilding};
        matches!(
            (self, next),
            (Absent, Assembling | Failed)
                | (Assembling, Healthy | Degraded | Absent | Failed)
                | (Healthy, Degraded | Absent | Failed)
                | (Degraded, Rebuilding | Absent | Failed)
                | (Rebuilding, Healthy | Degraded | Absent | Failed)
                | (Failed, Absent)
        )
    }

    /// An array is live in the data plane
    #[must_use]
    pub const fn is_assembled(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded | Self::Rebuilding)
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidTransition {
    pub from: RaidState,
    pub to: RaidState,
    /// Unix milliseconds
    pub at: i64,
}

/// Last known shape of a volume's RAID bdev
#[derive(Debug, Clone)]
pub struct RaidBdev {
    pub name: String,
    pub level: RaidLevel,
    /// Constituents in array order
    pub constituents: Vec<ReplicaName>,
    pub state: RaidState,
    pub history: VecDeque<RaidTransition>,
    history_limit: usize,
    pub last_error: Option<String>,
}

impl RaidBdev {
    pub fn new(name: impl Into<String>, level: RaidLevel, history_limit: usize) -> Self {
        Self {
            name: name.into(),
            level,
            constituents: Vec::new(),
            state: RaidState::Absent,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            last_error: None,
        }
    }

    /// Move to `next`, recording the change. A move to the current state is
    /// a no-op.
    pub fn transition(&mut self, next: RaidState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::internal(format!(
                "illegal RAID transition {:?} -> {:?} on {}",
                self.state, next, self.name
            )));
        }
        debug!(raid = %self.name, from = ?self.state, to = ?next, "RAID state change");
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(RaidTransition {
            from: self.state,
            to: next,
            at: chrono::Utc::now().timestamp_millis(),
        });
        self.state = next;
        if next != RaidState::Failed {
            self.last_error = None;
        }
        Ok(())
    }

    /// Mark the array failed with the given cause
    pub fn fail(&mut self, err: &Error) {
        if self.state != RaidState::Failed {
            // Every non-failed state may fail
            let _ = self.transition(RaidState::Failed);
        }
        self.last_error = Some(err.to_string());
        warn!(raid = %self.name, "RAID failed: {err}");
    }

    /// Forget a failed array so it can be assembled again
    pub fn reset(&mut self) -> Result<()> {
        self.constituents.clear();
        self.transition(RaidState::Absent)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.constituents.iter().map(ToString::to_string).collect()
    }

    pub fn is_constituent(&self, name: &str) -> bool {
        self.constituents.iter().any(|c| c.as_str() == name)
    }
}

/// How the live array compares with the desired constituents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// No array in the data plane
    Absent,
    /// Same members; for redundant levels order is not significant
    InSync,
    Diverged {
        additions: Vec<String>,
        removals: Vec<String>,
    },
}

/// Compare an observed array with the desired constituents.
///
/// A level mismatch, or a striped array whose members differ in any way,
/// cannot be fixed online and is `Unrecoverable`.
pub fn classify(level: RaidLevel, observed: Option<&RaidInfo>, desired: &[String]) -> Result<Divergence> {
    let Some(info) = observed else {
        return Ok(Divergence::Absent);
    };
    if info.level != level {
        return Err(Error::unrecoverable(format!(
            "{} is {} but the volume wants {level}",
            info.name, info.level
        )));
    }
    if info.members == desired {
        return Ok(Divergence::InSync);
    }

    let live: BTreeSet<&String> = info.members.iter().collect();
    let want: BTreeSet<&String> = desired.iter().collect();
    if !level.is_redundant() {
        return Err(Error::unrecoverable(format!(
            "{} has members {:?}, expected {:?}",
            info.name, info.members, desired
        )));
    }
    if live == want {
        return Ok(Divergence::InSync);
    }
    Ok(Divergence::Diverged {
        additions: desired
            .iter()
            .filter(|d| !live.contains(d))
            .cloned()
            .collect(),
        removals: info
            .members
            .iter()
            .filter(|m| !want.contains(m))
            .cloned()
            .collect(),
    })
}

/// Members of `desired` that hold no valid data yet, in order.
///
/// When every member is fresh the array is new and nothing needs
/// rebuilding. More stale members than the level tolerates is
/// `Unrecoverable`.
pub fn stale_members(
    level: RaidLevel,
    desired: &[ReplicaName],
    fresh: &BTreeSet<ReplicaName>,
) -> Result<Vec<ReplicaName>> {
    let stale: Vec<ReplicaName> = desired.iter().filter(|r| fresh.contains(*r)).cloned().collect();
    if stale.is_empty() || stale.len() == desired.len() {
        return Ok(Vec::new());
    }
    let tolerated = level.fault_tolerance(desired.len());
    if stale.len() > tolerated {
        return Err(Error::unrecoverable(format!(
            "{level} with {} members can rebuild {tolerated}, but {stale:?} hold no data",
            desired.len()
        )));
    }
    Ok(stale)
}

/// Drives the data plane toward a desired RAID shape
pub struct Reconciler {
    plane: Arc<dyn RaidPlane>,
    op_timeout: Duration,
    retry: RetryPolicy,
    sync_poll: Duration,
    sync_error_budget: u32,
    sync_timeout: Duration,
}

impl Reconciler {
    pub fn new(plane: Arc<dyn RaidPlane>, config: &EngineConfig) -> Self {
        Self {
            plane,
            op_timeout: config.op_timeout(),
            retry: config.assembly_retry(),
            sync_poll: config.sync_poll_interval(),
            sync_error_budget: config.sync_error_budget,
            sync_timeout: config.sync_timeout(),
        }
    }

    /// Live state of the array
    pub async fn observe(&self, name: &str) -> Result<Option<RaidInfo>> {
        bounded("observe raid", self.op_timeout, self.plane.get_raid(name)).await
    }

    /// Fold an observation into the cached record
    pub fn sync_observed(&self, raid: &mut RaidBdev, observed: Option<&RaidInfo>) -> Result<()> {
        match observed {
            None => {
                if raid.state.is_assembled() || raid.state == RaidState::Assembling {
                    warn!(raid = %raid.name, state = ?raid.state, "RAID vanished from the data plane");
                    raid.constituents.clear();
                    raid.transition(RaidState::Absent)?;
                }
            }
            Some(info) => {
                raid.constituents = info
                    .members
                    .iter()
                    .filter_map(|m| ReplicaName::new(m.as_str()).ok())
                    .collect();
                match raid.state {
                    RaidState::Absent => {
                        info!(raid = %raid.name, members = ?info.members, "adopting live RAID");
                        raid.transition(RaidState::Assembling)?;
                        raid.transition(if info.degraded {
                            RaidState::Degraded
                        } else {
                            RaidState::Healthy
                        })?;
                    }
                    RaidState::Healthy if info.degraded => raid.transition(RaidState::Degraded)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Bring the array in line with `desired`.
    ///
    /// `fresh` names replicas whose backing store was just allocated. They
    /// take their slots in the array as stale members and are filled in by
    /// a rebuild.
    pub async fn reconcile(
        &self,
        raid: &mut RaidBdev,
        desired: &[ReplicaName],
        fresh: &BTreeSet<ReplicaName>,
    ) -> Result<()> {
        if raid.state == RaidState::Failed {
            return Err(Error::Conflict(format!(
                "RAID {} is failed and must be recreated",
                raid.name
            )));
        }
        let observed = self.observe(&raid.name).await?;
        self.sync_observed(raid, observed.as_ref())?;

        let wanted: Vec<String> = desired.iter().map(ToString::to_string).collect();
        let divergence = match classify(raid.level, observed.as_ref(), &wanted) {
            Ok(d) => d,
            Err(e) => {
                raid.fail(&e);
                return Err(e);
            }
        };

        match divergence {
            Divergence::Absent => {
                let stale = match stale_members(raid.level, desired, fresh) {
                    Ok(stale) => stale,
                    Err(e) => {
                        raid.fail(&e);
                        return Err(e);
                    }
                };
                self.assemble(raid, desired, &stale).await?;
                if raid.state == RaidState::Degraded {
                    self.rebuild(raid).await?;
                }
            }
            Divergence::InSync => {
                if matches!(raid.state, RaidState::Degraded | RaidState::Rebuilding) {
                    self.rebuild(raid).await?;
                }
            }
            Divergence::Diverged { additions, removals } => {
                info!(raid = %raid.name, ?additions, ?removals, "RAID diverged from volume spec");
                for name in &removals {
                    let replica = ReplicaName::new(name.as_str())?;
                    self.remove_constituent(raid, &replica).await?;
                }
                for name in &additions {
                    let replica = ReplicaName::new(name.as_str())?;
                    self.add_constituent(raid, &replica, desired).await?;
                }
                if raid.state == RaidState::Degraded {
                    self.rebuild(raid).await?;
                }
            }
        }
        Ok(())
    }

    /// Create the array from `members` in order, retrying with backoff.
    /// With `stale` members the array comes up `Degraded`.
    ///
    /// Each attempt first observes the data plane: an array left behind by a
    /// timed-out attempt is accepted if it matches, and torn down otherwise.
    pub async fn assemble(
        &self,
        raid: &mut RaidBdev,
        members: &[ReplicaName],
        stale: &[ReplicaName],
    ) -> Result<()> {
        raid.transition(RaidState::Assembling)?;
        let names: Vec<String> = members.iter().map(ToString::to_string).collect();
        let stale_names: Vec<String> = stale.iter().map(ToString::to_string).collect();
        let (name, level) = (raid.name.as_str(), raid.level);
        let (names_ref, stale_ref) = (names.as_slice(), stale_names.as_slice());

        let result = self
            .retry
            .run("assemble raid", move |attempt| {
                self.assemble_attempt(name, level, names_ref, stale_ref, attempt)
            })
            .await;

        match result {
            Ok(()) => {
                raid.constituents = members.to_vec();
                raid.transition(if stale.is_empty() {
                    RaidState::Healthy
                } else {
                    RaidState::Degraded
                })?;
                info!(raid = %raid.name, level = %raid.level, members = ?names, stale = ?stale_names, "RAID assembled");
                Ok(())
            }
            Err(e) => {
                raid.fail(&e);
                Err(e)
            }
        }
    }

    async fn assemble_attempt(
        &self,
        name: &str,
        level: RaidLevel,
        members: &[String],
        stale: &[String],
        attempt: u32,
    ) -> Result<()> {
        if let Some(info) = self.observe(name).await? {
            if info.level == level && info.members == members {
                debug!(raid = name, attempt, "RAID already assembled");
                return Ok(());
            }
            warn!(raid = name, attempt, live = ?info.members, "tearing down mismatched RAID");
            bounded("delete raid", self.op_timeout, self.plane.delete_raid(name)).await?;
        }
        bounded(
            "create raid",
            self.op_timeout,
            self.plane.create_raid(name, level, members, stale),
        )
        .await
        .map_err(|e| assembly_timeout(name, e))
    }

    /// Add a constituent and rebuild onto it.
    ///
    /// The replica goes in after every constituent that precedes it in
    /// `order`; constituents missing from `order` count as preceding.
    pub async fn add_constituent(
        &self,
        raid: &mut RaidBdev,
        replica: &ReplicaName,
        order: &[ReplicaName],
    ) -> Result<()> {
        if !raid.level.is_redundant() {
            return Err(Error::invalid_argument(format!(
                "{} does not support adding members",
                raid.level
            )));
        }
        if !raid.state.is_assembled() {
            return Err(Error::Conflict(format!(
                "RAID {} is {:?}",
                raid.name, raid.state
            )));
        }

        let rank = |r: &ReplicaName| order.iter().position(|o| o == r);
        let slot = rank(replica).map_or(raid.constituents.len(), |own| {
            raid.constituents
                .iter()
                .filter(|c| rank(*c).is_none_or(|r| r < own))
                .count()
        });

        let live = self.observe(&raid.name).await?;
        let present = live
            .as_ref()
            .is_some_and(|info| info.members.iter().any(|m| m == replica.as_str()));
        if !present {
            let (name, bdev) = (raid.name.as_str(), replica.as_str());
            let result = self
                .retry
                .run("add raid member", move |_| {
                    let plane = &self.plane;
                    async move {
                        bounded(
                            "add raid member",
                            self.op_timeout,
                            plane.add_member(name, bdev, slot),
                        )
                        .await
                        .map_err(|e| assembly_timeout(name, e))
                    }
                })
                .await;
            self.settle(raid, result)?;
        }
        if !raid.is_constituent(replica.as_str()) {
            raid.constituents.insert(slot, replica.clone());
        }
        if raid.state == RaidState::Healthy || raid.state == RaidState::Rebuilding {
            raid.transition(RaidState::Degraded)?;
        }
        info!(raid = %raid.name, replica = %replica, "added RAID constituent");
        self.rebuild(raid).await
    }

    /// Detach a constituent and rebuild what remains.
    ///
    /// A replica that is not a constituent is a `ConstituentMismatch` and
    /// leaves the array untouched.
    pub async fn remove_constituent(&self, raid: &mut RaidBdev, replica: &ReplicaName) -> Result<()> {
        if !raid.is_constituent(replica.as_str()) {
            return Err(Error::mismatch(format!(
                "{replica} is not a constituent of {}",
                raid.name
            )));
        }
        if !raid.level.is_redundant() {
            return Err(Error::invalid_argument(format!(
                "{} does not support removing members",
                raid.level
            )));
        }
        if raid.constituents.len() <= raid.level.min_members() {
            return Err(Error::invalid_argument(format!(
                "{} needs at least {} members",
                raid.level,
                raid.level.min_members()
            )));
        }

        let live = self.observe(&raid.name).await?;
        let present = live
            .as_ref()
            .is_some_and(|info| info.members.iter().any(|m| m == replica.as_str()));
        if present {
            self.quiesce(raid).await?;
            let (name, bdev) = (raid.name.as_str(), replica.as_str());
            let removed = self
                .retry
                .run("remove raid member", move |_| {
                    let plane = &self.plane;
                    async move {
                        bounded(
                            "remove raid member",
                            self.op_timeout,
                            plane.remove_member(name, bdev),
                        )
                        .await
                        .map_err(|e| assembly_timeout(name, e))
                    }
                })
                .await;
            let resumed = self.resume(raid).await;
            self.settle(raid, removed)?;
            resumed?;
        }

        raid.constituents.retain(|c| c != replica);
        if raid.state != RaidState::Degraded {
            raid.transition(RaidState::Degraded)?;
        }
        info!(raid = %raid.name, replica = %replica, "removed RAID constituent");
        self.rebuild(raid).await
    }

    /// Run a rebuild to completion.
    ///
    /// The sync is started whenever the data plane reports it idle. Failed
    /// starts and failed polls share one error budget.
    pub async fn rebuild(&self, raid: &mut RaidBdev) -> Result<()> {
        let name = raid.name.clone();
        if raid.state != RaidState::Rebuilding {
            raid.transition(RaidState::Rebuilding)?;
        }

        let deadline = Instant::now() + self.sync_timeout;
        let mut errors = 0u32;
        loop {
            if Instant::now() >= deadline {
                let e = Error::unrecoverable(format!(
                    "rebuild of {name} did not finish within {} ms",
                    self.sync_timeout.as_millis()
                ));
                raid.fail(&e);
                return Err(e);
            }
            let step = match bounded("sync status", self.op_timeout, self.plane.sync_status(&name)).await {
                Ok(SyncStatus::Complete) => {
                    raid.transition(RaidState::Healthy)?;
                    info!(raid = %name, "rebuild complete");
                    return Ok(());
                }
                Ok(SyncStatus::InProgress { percent }) => {
                    debug!(raid = %name, percent, "rebuild in progress");
                    Ok(())
                }
                Ok(SyncStatus::Idle) => {
                    debug!(raid = %name, "starting rebuild");
                    bounded("start rebuild", self.op_timeout, self.plane.start_rebuild(&name)).await
                }
                Ok(SyncStatus::Failed) => {
                    let e = Error::unrecoverable(format!("rebuild of {name} failed"));
                    raid.fail(&e);
                    return Err(e);
                }
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                if e.kind() == ErrorKind::Unrecoverable {
                    raid.fail(&e);
                    return Err(e);
                }
                errors += 1;
                warn!(raid = %name, errors, budget = self.sync_error_budget, "rebuild step failed: {e}");
                if errors > self.sync_error_budget {
                    let e = Error::RetriesExhausted {
                        operation: "rebuild".to_string(),
                        attempts: errors,
                        last: Box::new(e),
                    };
                    raid.fail(&e);
                    return Err(e);
                }
            }
            tokio::time::sleep(self.sync_poll).await;
        }
    }

    pub async fn quiesce(&self, raid: &RaidBdev) -> Result<()> {
        bounded("quiesce raid", self.op_timeout, self.plane.quiesce(&raid.name)).await
    }

    pub async fn resume(&self, raid: &RaidBdev) -> Result<()> {
        bounded("resume raid", self.op_timeout, self.plane.resume(&raid.name)).await
    }

    pub async fn expose(&self, raid: &RaidBdev, frontend: FrontendType) -> Result<String> {
        bounded(
            "expose raid",
            self.op_timeout,
            self.plane.expose(&raid.name, frontend),
        )
        .await
    }

    /// Withdraw the frontend and delete the array. Constituent bdevs stay
    /// attached.
    pub async fn teardown(&self, raid: &mut RaidBdev) -> Result<()> {
        bounded("unexpose raid", self.op_timeout, self.plane.unexpose(&raid.name)).await?;
        bounded("delete raid", self.op_timeout, self.plane.delete_raid(&raid.name)).await?;
        raid.reset()?;
        info!(raid = %raid.name, "RAID torn down");
        Ok(())
    }

    /// Unrecoverable outcomes of data-plane changes fail the array
    fn settle(&self, raid: &mut RaidBdev, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Unrecoverable {
                raid.fail(e);
            }
        }
        result
    }
}

/// Deadlines on create/adjust calls are assembly timeouts
fn assembly_timeout(raid: &str, err: Error) -> Error {
    match err {
        Error::Timeout { timeout_ms, .. } => Error::AssemblyTimeout {
            raid: raid.to_string(),
            timeout_ms,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BackingSpec, DiskDriver};
    use crate::local::LocalDataPlane;
    use raidvol_common::config::FrontendConfig;
    use raidvol_common::ReplicaAddress;
    use tempfile::{TempDir, tempdir};

    fn engine_config() -> EngineConfig {
        EngineConfig {
            op_timeout_ms: 100,
            assembly_max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            backoff_jitter: 0.0,
            sync_poll_interval_ms: 1,
            sync_error_budget: 2,
            ..EngineConfig::default()
        }
    }

    async fn setup(replicas: &[&str]) -> (TempDir, Arc<LocalDataPlane>, Reconciler) {
        let dir = tempdir().unwrap();
        let plane = Arc::new(LocalDataPlane::new(dir.path(), FrontendConfig::default()));
        for r in replicas {
            let name = ReplicaName::new(*r).unwrap();
            let spec = BackingSpec {
                path: plane.resolve_path(&ReplicaAddress::new(*r)),
                name,
                size_bytes: 1024 * 1024,
            };
            plane.create_backing_store(&spec).await.unwrap();
        }
        let reconciler = Reconciler::new(plane.clone(), &engine_config());
        (dir, plane, reconciler)
    }

    fn names(list: &[&str]) -> Vec<ReplicaName> {
        list.iter().map(|n| ReplicaName::new(*n).unwrap()).collect()
    }

    fn states(raid: &RaidBdev) -> Vec<RaidState> {
        let mut out = vec![raid.history[0].from];
        out.extend(raid.history.iter().map(|t| t.to));
        out
    }

    #[test]
    fn test_transition_table() {
        assert!(RaidState::Absent.can_transition_to(RaidState::Assembling));
        assert!(RaidState::Rebuilding.can_transition_to(RaidState::Healthy));
        assert!(!RaidState::Absent.can_transition_to(RaidState::Healthy));
        assert!(!RaidState::Failed.can_transition_to(RaidState::Healthy));
        assert!(!RaidState::Healthy.can_transition_to(RaidState::Rebuilding));

        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 2);
        assert_eq!(
            raid.transition(RaidState::Healthy).unwrap_err().kind(),
            ErrorKind::Internal
        );
        raid.transition(RaidState::Assembling).unwrap();
        raid.transition(RaidState::Healthy).unwrap();
        raid.transition(RaidState::Degraded).unwrap();
        // History is bounded
        assert_eq!(raid.history.len(), 2);
        assert_eq!(raid.history[0].to, RaidState::Healthy);
    }

    #[test]
    fn test_classify() {
        let info = |level, members: &[&str]| RaidInfo {
            name: "v1".to_string(),
            level,
            members: members.iter().map(ToString::to_string).collect(),
            degraded: false,
            quiesced: false,
        };
        let want = |m: &[&str]| m.iter().map(ToString::to_string).collect::<Vec<_>>();

        assert_eq!(
            classify(RaidLevel::Raid1, None, &want(&["a"])).unwrap(),
            Divergence::Absent
        );
        assert_eq!(
            classify(RaidLevel::Raid1, Some(&info(RaidLevel::Raid1, &["b", "a"])), &want(&["a", "b"]))
                .unwrap(),
            Divergence::InSync
        );
        assert_eq!(
            classify(RaidLevel::Raid1, Some(&info(RaidLevel::Raid1, &["a", "b"])), &want(&["a", "c"]))
                .unwrap(),
            Divergence::Diverged {
                additions: vec!["c".to_string()],
                removals: vec!["b".to_string()],
            }
        );
        let err = classify(RaidLevel::Raid1, Some(&info(RaidLevel::Raid0, &["a"])), &want(&["a"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        let err = classify(RaidLevel::Raid0, Some(&info(RaidLevel::Raid0, &["b", "a"])), &want(&["a", "b"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
    }

    #[tokio::test]
    async fn test_assemble_is_idempotent() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3"]).await;
        let members = names(&["r1", "r2", "r3"]);

        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler.assemble(&mut raid, &members, &[]).await.unwrap();
        assert_eq!(raid.state, RaidState::Healthy);

        // A second record for the same array adopts it rather than failing
        let mut again = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .reconcile(&mut again, &members, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(again.state, RaidState::Healthy);
        assert_eq!(again.constituents, members);
        assert_eq!(plane.create_raid_calls(), 1);
    }

    #[tokio::test]
    async fn test_assembly_gives_up_after_bounded_attempts() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2"]).await;
        plane.faults().hang_create_raid(u32::MAX);

        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        let err = reconciler
            .assemble(&mut raid, &names(&["r1", "r2"]), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        assert!(matches!(
            err.root(),
            Error::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(plane.create_raid_calls(), 3);
        assert_eq!(raid.state, RaidState::Failed);
        assert!(raid.last_error.is_some());
    }

    #[tokio::test]
    async fn test_half_created_array_is_adopted() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2"]).await;
        plane.faults().hang_after_create_raid(1);

        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .assemble(&mut raid, &names(&["r1", "r2"]), &[])
            .await
            .unwrap();
        assert_eq!(raid.state, RaidState::Healthy);
        assert_eq!(plane.create_raid_calls(), 1);
    }

    #[tokio::test]
    async fn test_remove_constituent_rebuilds() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3"]).await;
        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .assemble(&mut raid, &names(&["r1", "r2", "r3"]), &[])
            .await
            .unwrap();

        reconciler
            .remove_constituent(&mut raid, &ReplicaName::new("r2").unwrap())
            .await
            .unwrap();
        assert_eq!(raid.constituents, names(&["r1", "r3"]));
        assert_eq!(
            states(&raid),
            vec![
                RaidState::Absent,
                RaidState::Assembling,
                RaidState::Healthy,
                RaidState::Degraded,
                RaidState::Rebuilding,
                RaidState::Healthy,
            ]
        );
        let info = plane.get_raid("v1").await.unwrap().unwrap();
        assert_eq!(info.members, vec!["r1", "r3"]);
        assert!(!info.quiesced);

        // Not a constituent: rejected, nothing changes
        let before = raid.history.len();
        let err = reconciler
            .remove_constituent(&mut raid, &ReplicaName::new("r2").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstituentMismatch);
        assert_eq!(raid.history.len(), before);
        assert_eq!(raid.state, RaidState::Healthy);
    }

    #[tokio::test]
    async fn test_sync_error_budget_fails_array() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3"]).await;
        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .assemble(&mut raid, &names(&["r1", "r2"]), &[])
            .await
            .unwrap();

        plane.faults().fail_sync_polls(u32::MAX);
        let err = reconciler
            .add_constituent(&mut raid, &ReplicaName::new("r3").unwrap(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        assert_eq!(raid.state, RaidState::Failed);
    }

    #[tokio::test]
    async fn test_permanent_sync_failure_fails_array() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3"]).await;
        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .assemble(&mut raid, &names(&["r1", "r2", "r3"]), &[])
            .await
            .unwrap();

        plane.faults().set_sync_failed(true);
        let err = reconciler
            .remove_constituent(&mut raid, &ReplicaName::new("r3").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        assert_eq!(raid.state, RaidState::Failed);
        assert!(raid.last_error.as_deref().unwrap().contains("rebuild of v1 failed"));

        // Only an explicit reset leaves Failed
        let err = reconciler
            .reconcile(&mut raid, &names(&["r1", "r2"]), &BTreeSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        raid.reset().unwrap();
        assert_eq!(raid.state, RaidState::Absent);
    }

    #[tokio::test]
    async fn test_fresh_replicas_join_by_rebuild() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3"]).await;
        let fresh: BTreeSet<_> = names(&["r2"]).into_iter().collect();

        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .reconcile(&mut raid, &names(&["r1", "r2", "r3"]), &fresh)
            .await
            .unwrap();
        assert_eq!(raid.constituents, names(&["r1", "r2", "r3"]));
        assert_eq!(
            states(&raid),
            vec![
                RaidState::Absent,
                RaidState::Assembling,
                RaidState::Degraded,
                RaidState::Rebuilding,
                RaidState::Healthy,
            ]
        );
        assert_eq!(
            plane.get_raid("v1").await.unwrap().unwrap().members,
            vec!["r1", "r2", "r3"]
        );
    }

    #[tokio::test]
    async fn test_too_many_fresh_replicas_fail_assembly() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3"]).await;
        let fresh: BTreeSet<_> = names(&["r1", "r3"]).into_iter().collect();

        let mut raid = RaidBdev::new("v1", RaidLevel::Raid5f, 16);
        let err = reconciler
            .reconcile(&mut raid, &names(&["r1", "r2", "r3"]), &fresh)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        assert_eq!(raid.state, RaidState::Failed);
        assert_eq!(plane.create_raid_calls(), 0);

        // A brand new array has nothing to rebuild
        let fresh: BTreeSet<_> = names(&["r1", "r2", "r3"]).into_iter().collect();
        let mut raid = RaidBdev::new("v1", RaidLevel::Raid5f, 16);
        reconciler
            .reconcile(&mut raid, &names(&["r1", "r2", "r3"]), &fresh)
            .await
            .unwrap();
        assert_eq!(raid.state, RaidState::Healthy);
    }

    #[tokio::test]
    async fn test_added_constituent_keeps_volume_order() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3"]).await;
        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .assemble(&mut raid, &names(&["r1", "r3"]), &[])
            .await
            .unwrap();

        reconciler
            .add_constituent(
                &mut raid,
                &ReplicaName::new("r2").unwrap(),
                &names(&["r1", "r2", "r3"]),
            )
            .await
            .unwrap();
        assert_eq!(raid.constituents, names(&["r1", "r2", "r3"]));
        assert_eq!(
            plane.get_raid("v1").await.unwrap().unwrap().members,
            vec!["r1", "r2", "r3"]
        );
    }

    #[tokio::test]
    async fn test_rebuild_start_failures_share_error_budget() {
        let (_dir, plane, reconciler) = setup(&["r1", "r2", "r3", "r4"]).await;
        let mut raid = RaidBdev::new("v1", RaidLevel::Raid1, 16);
        reconciler
            .assemble(&mut raid, &names(&["r1", "r2"]), &[])
            .await
            .unwrap();
        let order = names(&["r1", "r2", "r3", "r4"]);

        // Within budget: the start is retried on the next poll
        plane.faults().fail_start_rebuild(1);
        reconciler
            .add_constituent(&mut raid, &ReplicaName::new("r3").unwrap(), &order)
            .await
            .unwrap();
        assert_eq!(raid.state, RaidState::Healthy);

        plane.faults().fail_start_rebuild(u32::MAX);
        let err = reconciler
            .add_constituent(&mut raid, &ReplicaName::new("r4").unwrap(), &order)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        assert!(matches!(
            err.root(),
            Error::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(raid.state, RaidState::Failed);
    }
}
