//! Settings errors.

use thiserror::Error;

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Failure loading or parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid JSON.
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),

    /// An env override carried a value of the wrong shape.
    #[error("invalid value for {var}: {message}")]
    InvalidEnv {
        /// The offending variable name.
        var: String,
        /// Why the value was rejected.
        message: String,
    },
}
