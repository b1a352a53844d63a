//! Error taxonomy for the loader.
//!
//! Per-record and per-batch problems ([`SourceError::Corrupt`], [`ValidationError`],
//! [`DuplicateConflict`], batch write rejections) are recovered locally and end up in
//! the run statistics and the checkpoint's error tail. Only [`LoadError`] aborts a run.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("record at offset {offset} is not valid structured data: {message}")]
    Corrupt { offset: u64, message: String },
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl ValidationError {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::NotAnObject => None,
            ValidationError::MissingField(field) => Some(field),
            ValidationError::InvalidField { field, .. } => Some(field),
        }
    }
}

/// Two person records that look like the same individual but were not unified.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("person {candidate_id} matched {existing_id} by {tier} but was not merged: {reason}")]
pub struct DuplicateConflict {
    pub candidate_id: String,
    pub existing_id: String,
    pub tier: &'static str,
    pub reason: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached at all
    #[error("graph store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but refused the operation
    #[error("graph store rejected the write: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors that end a run. Everything else is recorded and skipped.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("graph store unreachable after {attempts} attempt(s): {source}")]
    ConnectionFatal { attempts: u32, source: StoreError },
    #[error("failed to read source: {0}")]
    Source(#[source] std::io::Error),
    #[error("aborting on corrupt record at offset {offset}: {message}")]
    CorruptAbort { offset: u64, message: String },
    #[error("checkpoint persistence failed: {0:#}")]
    Checkpoint(anyhow::Error),
}

/// Failure categories recorded in the checkpoint's error tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceCorrupt,
    Validation,
    DuplicateConflict,
    Write,
    HierarchyCycle,
}
