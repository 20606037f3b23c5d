//! Core type definitions for raidvol
//!
//! Identifiers, RAID levels, frontend types and the durable
//! [`VolumeSpec`] that every in-memory structure is reconciled against.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum length of a volume id or replica name
pub const MAX_NAME_LEN: usize = 64;

/// Errors that can occur when validating a volume id or replica name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,
    #[error("name must be at most {MAX_NAME_LEN} characters")]
    TooLong,
    #[error("invalid character in name: {0:?}")]
    InvalidChar(char),
}

impl From<NameError> for Error {
    fn from(e: NameError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

fn validate_name(name: &str) -> std::result::Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        return Err(NameError::InvalidChar(c));
    }
    Ok(())
}

/// Unique identifier for a volume
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> std::result::Result<Self, NameError> {
        let id = id.into();
        validate_name(&id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({:?})", self.0)
    }
}

impl TryFrom<String> for VolumeId {
    type Error = NameError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeId> for String {
    fn from(id: VolumeId) -> Self {
        id.0
    }
}

impl Borrow<str> for VolumeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Name of a replica; also the name of its bdev while attached
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct ReplicaName(String);

impl ReplicaName {
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, NameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReplicaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaName({:?})", self.0)
    }
}

impl TryFrom<String> for ReplicaName {
    type Error = NameError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ReplicaName> for String {
    fn from(name: ReplicaName) -> Self {
        name.0
    }
}

impl Borrow<str> for ReplicaName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Location of a replica's backing store as given by the caller.
///
/// Either a bare name (`r1`), or a path whose file stem is the replica
/// name (`/srv/replicas/r1.img`). Relative addresses are resolved by the
/// disk driver against its replica directory.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ReplicaAddress(String);

impl ReplicaAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Replica name derived from the address
    pub fn name(&self) -> std::result::Result<ReplicaName, NameError> {
        let last = self.0.rsplit('/').next().unwrap_or_default();
        let stem = match last.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem,
            _ => last,
        };
        ReplicaName::new(stem)
    }
}

impl fmt::Debug for ReplicaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaAddress({:?})", self.0)
    }
}

impl From<&str> for ReplicaAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// RAID level of an assembled volume
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    /// Striping, no redundancy; membership is fixed after assembly
    Raid0,
    /// Mirroring
    Raid1,
    /// Single parity
    Raid5f,
}

impl RaidLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raid0 => "raid0",
            Self::Raid1 => "raid1",
            Self::Raid5f => "raid5f",
        }
    }

    /// Minimum number of constituents for a usable array
    #[must_use]
    pub const fn min_members(self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 => 1,
            Self::Raid5f => 3,
        }
    }

    /// Whether constituents can be added or removed on a live array
    #[must_use]
    pub const fn is_redundant(self) -> bool {
        !matches!(self, Self::Raid0)
    }

    /// How many of `members` may hold no valid data while the array can
    /// still rebuild them
    #[must_use]
    pub const fn fault_tolerance(self, members: usize) -> usize {
        match self {
            Self::Raid0 => 0,
            Self::Raid1 => members.saturating_sub(1),
            Self::Raid5f => 1,
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaidLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "raid0" => Ok(Self::Raid0),
            "1" | "raid1" => Ok(Self::Raid1),
            "5" | "5f" | "raid5f" => Ok(Self::Raid5f),
            other => Err(Error::invalid_argument(format!(
                "unsupported RAID level: {other}"
            ))),
        }
    }
}

/// How the assembled volume is exposed to consumers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendType {
    /// Not exposed; the RAID bdev is only reachable inside the data plane
    #[default]
    None,
    /// NVMe over TCP target
    Nvmf,
    /// Local block device node
    Blockdev,
}

impl fmt::Display for FrontendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Nvmf => "nvmf",
            Self::Blockdev => "blockdev",
        })
    }
}

/// Durable description of a volume: the only source of truth across restarts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub volume_id: VolumeId,
    /// Ordered; the order is the constituent order of the RAID bdev
    pub replicas: Vec<ReplicaAddress>,
    pub raid_level: RaidLevel,
    #[serde(default)]
    pub frontend: FrontendType,
    pub size_bytes: u64,
}

impl VolumeSpec {
    /// Ordered replica names
    pub fn replica_names(&self) -> Result<Vec<ReplicaName>> {
        self.replicas
            .iter()
            .map(|a| a.name().map_err(Error::from))
            .collect()
    }

    /// Address of the replica with the given name
    #[must_use]
    pub fn address_of(&self, name: &str) -> Option<&ReplicaAddress> {
        self.replicas
            .iter()
            .find(|a| a.name().is_ok_and(|n| n.as_str() == name))
    }

    /// Check replica names are valid and unique and the level is satisfiable
    pub fn validate(&self) -> Result<()> {
        if self.size_bytes == 0 {
            return Err(Error::invalid_argument("size must be positive"));
        }
        let names = self.replica_names()?;
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "duplicate replica {name} in volume {}",
                    self.volume_id
                )));
            }
        }
        if names.len() < self.raid_level.min_members() {
            return Err(Error::invalid_argument(format!(
                "{} needs at least {} replicas, got {}",
                self.raid_level,
                self.raid_level.min_members(),
                names.len()
            )));
        }
        Ok(())
    }
}
