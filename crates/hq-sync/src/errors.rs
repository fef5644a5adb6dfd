//! Sync errors.

use thiserror::Error;

/// Result alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure in the mirror pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Listing the remote prefix failed; the cycle aborts, state untouched.
    #[error("failed to list remote prefix: {0}")]
    List(String),

    /// A single object download failed; counted, cycle continues.
    #[error("failed to download {key}: {message}")]
    Download {
        /// Object key.
        key: String,
        /// Underlying failure.
        message: String,
    },

    /// Local filesystem failure.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    /// State file could not be parsed or written.
    #[error("sync state error: {0}")]
    State(String),

    /// An ignore pattern failed to compile.
    #[error("invalid ignore pattern '{pattern}': {message}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// Compiler diagnostic.
        message: String,
    },

    /// Cooperative cancellation.
    #[error("cancelled")]
    Cancelled,
}

impl From<SyncError> for hq_core::errors::HqError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Cancelled => Self::Cancelled,
            SyncError::List(message) => Self::Transport { message },
            SyncError::Download { key, message } => Self::Transport {
                message: format!("{key}: {message}"),
            },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}
