//! Error taxonomy for the index builder and query engine.
//!
//! Every fatal condition carries enough context to tell an operator which
//! check failed and with what measured value, since the only recovery path
//! is a re-run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KbError {
    /// A document is malformed, incomplete, or oversized.
    #[error("invalid document {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    /// Processing even a single document would breach the hard memory limit.
    #[error(
        "projected memory usage {projected_mb:.1} MB exceeds limit {limit_mb:.1} MB \
         at minimum batch size (resident {resident_mb:.1} MB)"
    )]
    MemoryBudget {
        projected_mb: f64,
        limit_mb: f64,
        resident_mb: f64,
    },

    /// A hard memory limit is configured but resident memory cannot be read.
    #[error("resident memory cannot be sampled on this platform, cannot enforce limit {limit_mb:.1} MB")]
    MemoryUnavailable { limit_mb: f64 },

    /// The FTS5 self-check or the SQLite integrity check failed.
    #[error("{check} integrity check failed: {detail}")]
    Integrity { check: &'static str, detail: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl KbError {
    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        KbError::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KbError>;
