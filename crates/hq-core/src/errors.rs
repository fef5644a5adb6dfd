//! The shared error taxonomy.
//!
//! Every fallible path in the system resolves to one of these categories.
//! The HTTP layer maps each variant to a status code via
//! [`HqError::http_status`]; the relay and poller decide retry/drop/abort
//! behavior on the same categories.

use thiserror::Error;

/// Top-level error taxonomy for the HQ control plane.
#[derive(Debug, Error)]
pub enum HqError {
    /// Input failed validation. Recovered locally, surfaced as HTTP 400.
    #[error("{message}")]
    Validation {
        /// Human-readable description of the validation failure.
        message: String,
        /// Optional per-field details, surfaced as `validationErrors`.
        validation_errors: Option<Vec<String>>,
    },

    /// Missing or invalid credentials (HTTP 401).
    #[error("unauthorized")]
    Unauthorized,

    /// Valid credentials, insufficient or consumed access (HTTP 403).
    #[error("forbidden: {message}")]
    Forbidden {
        /// Why access was denied.
        message: String,
    },

    /// Requested entity does not exist (HTTP 404).
    #[error("{resource} not found")]
    NotFound {
        /// The kind and identity of the missing entity.
        resource: String,
    },

    /// Operation conflicts with current state (HTTP 409).
    #[error("{message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// Caller exhausted its token bucket (HTTP 429).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit {
        /// Milliseconds until a token becomes available.
        retry_after_ms: u64,
    },

    /// Network or object-store failure. Retried with backoff before being
    /// surfaced.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Malformed frame on either side of the relay. Closes the offending
    /// connection; never propagated into session status.
    #[error("protocol error: {message}")]
    Protocol {
        /// What was malformed.
        message: String,
    },

    /// Cooperative cancellation. Never logged as an error.
    #[error("cancelled")]
    Cancelled,

    /// Any unexpected condition (HTTP 500).
    #[error("internal error: {message}")]
    Internal {
        /// Context for the log line; not exposed to callers verbatim.
        message: String,
    },
}

impl HqError {
    /// Shorthand for a [`HqError::Validation`] without field details.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            validation_errors: None,
        }
    }

    /// Shorthand for a [`HqError::NotFound`].
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Shorthand for a [`HqError::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Shorthand for a [`HqError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The HTTP status code this category maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::Protocol { .. } => 400,
            Self::Unauthorized => 401,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::RateLimit { .. } => 429,
            Self::Transport { .. } | Self::Internal { .. } | Self::Cancelled => 500,
        }
    }

    /// Whether a transport-level retry is worthwhile for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
