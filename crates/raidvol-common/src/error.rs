//! Error types for raidvol
//!
//! Every error carries an [`ErrorKind`]. Layers wrap errors with an
//! [`OpContext`] on the way up, and wrapping never changes the kind: retry
//! decisions upstream are made on `kind()`, not on the message.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Common result type for raidvol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error classification shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Underlying I/O hiccup, eligible for bounded retry
    TransientIo,
    /// RAID create/adjust exceeded its deadline
    AssemblyTimeout,
    /// Requested change does not match the live topology
    ConstituentMismatch,
    ResourceExhausted,
    AlreadyExists,
    NotFound,
    Busy,
    Conflict,
    /// Retries exhausted or permanent data-plane failure
    Unrecoverable,
    InvalidArgument,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientIo => "transient_io",
            Self::AssemblyTimeout => "assembly_timeout",
            Self::ConstituentMismatch => "constituent_mismatch",
            Self::ResourceExhausted => "resource_exhausted",
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::Conflict => "conflict",
            Self::Unrecoverable => "unrecoverable",
            Self::InvalidArgument => "invalid_argument",
            Self::Internal => "internal",
        }
    }

    /// Only transient I/O and assembly timeouts are retried, and only a
    /// bounded number of times.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientIo | Self::AssemblyTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation context attached to an error as it propagates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    pub operation: &'static str,
    pub volume_id: Option<String>,
    pub replica: Option<String>,
}

impl OpContext {
    #[must_use]
    pub const fn new(operation: &'static str) -> Self {
        Self {
            operation,
            volume_id: None,
            replica: None,
        }
    }

    #[must_use]
    pub fn volume(mut self, volume_id: impl fmt::Display) -> Self {
        self.volume_id = Some(volume_id.to_string());
        self
    }

    #[must_use]
    pub fn replica(mut self, replica: impl fmt::Display) -> Self {
        self.replica = Some(replica.to_string());
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation)?;
        if let Some(volume_id) = &self.volume_id {
            write!(f, " volume={volume_id}")?;
        }
        if let Some(replica) = &self.replica {
            write!(f, " replica={replica}")?;
        }
        Ok(())
    }
}

/// Common error type for raidvol
#[derive(Debug, Error)]
pub enum Error {
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("RAID {raid} assembly timed out after {timeout_ms} ms")]
    AssemblyTimeout { raid: String, timeout_ms: u64 },

    #[error("constituent mismatch: {0}")]
    ConstituentMismatch(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: OpContext,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::ConstituentMismatch(msg.into())
    }

    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classification of this error, looking through any context wrappers
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientIo(_) | Self::Io(_) | Self::Timeout { .. } | Self::Metadata(_) => {
                ErrorKind::TransientIo
            }
            Self::AssemblyTimeout { .. } => ErrorKind::AssemblyTimeout,
            Self::ConstituentMismatch(_) => ErrorKind::ConstituentMismatch,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unrecoverable(_) | Self::RetriesExhausted { .. } => ErrorKind::Unrecoverable,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Innermost error beneath all context wrappers
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Wrap with operation context; the kind is preserved
    #[must_use]
    pub fn with_context(self, context: OpContext) -> Self {
        Self::Context {
            context,
            source: Box::new(self),
        }
    }
}

/// Extension for attaching [`OpContext`] to results
pub trait ResultExt<T> {
    fn context(self, context: impl FnOnce() -> OpContext) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl FnOnce() -> OpContext) -> Result<T> {
        self.map_err(|e| e.into().with_context(context()))
    }
}
