//! Fleet errors.

use thiserror::Error;

/// Result alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

/// Failure launching or managing a fleet task.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The requested cpu/memory pair is not supported by the backend.
    #[error("unsupported cpu/memory combination: {cpu} cpu units with {memory} MiB")]
    InvalidResources {
        /// Requested CPU units.
        cpu: u32,
        /// Requested memory in MiB.
        memory: u32,
    },

    /// Task submission or control-call failure after retries.
    #[error("fleet request failed: {0}")]
    Transport(String),

    /// The scheduler answered with a non-success status.
    #[error("fleet rejected the request ({status}): {message}")]
    Rejected {
        /// HTTP status from the scheduler.
        status: u16,
        /// Scheduler-provided detail.
        message: String,
    },

    /// Unknown tracking ID.
    #[error("task {0} not found")]
    TaskNotFound(String),
}

impl From<FleetError> for hq_core::errors::HqError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::InvalidResources { .. } => Self::Validation {
                message: err.to_string(),
                validation_errors: None,
            },
            FleetError::TaskNotFound(id) => Self::NotFound {
                resource: format!("task {id}"),
            },
            FleetError::Transport(message) => Self::Transport { message },
            FleetError::Rejected { .. } => Self::Internal {
                message: err.to_string(),
            },
        }
    }
}
