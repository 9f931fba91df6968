//! Tagged storage errors (spec §7). Only [`StorageError::InvalidId`],
//! [`StorageError::EnvironmentUnsupported`], and [`StorageError::ReadOnly`]
//! terminate an operation with no recovery path; every other variant is
//! either recovered locally (`NotFound` -> `None`) or retried by the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("corrupt object at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("write rejected: storage is read-only")]
    ReadOnly,

    #[error("rejected: backpressure ceiling reached")]
    Overloaded,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid id: {0:?}")]
    InvalidId(String),

    #[error("environment unsupported: {0}")]
    EnvironmentUnsupported(String),

    #[error("write failed after retries: {0}")]
    Write(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupt {
            path: String::new(),
            reason: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
