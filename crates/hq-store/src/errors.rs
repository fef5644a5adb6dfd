//! Store errors.

use thiserror::Error;

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure in the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool exhausted or broken.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Row payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Operation conflicts with current state (e.g. a second pending
    /// question for the same worker, answering an answered question).
    #[error("{0}")]
    Conflict(String),

    /// Lock poisoning or other invariant breakage.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<StoreError> for hq_core::errors::HqError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(resource) => Self::NotFound { resource },
            StoreError::Conflict(message) => Self::Conflict { message },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}
