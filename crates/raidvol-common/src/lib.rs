//! raidvol Common - Shared types and utilities
//!
//! This crate provides the volume specification types, the error taxonomy,
//! configuration and the bounded retry policy used across all raidvol
//! components.

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, OpContext, Result, ResultExt};
pub use retry::RetryPolicy;
pub use types::*;
