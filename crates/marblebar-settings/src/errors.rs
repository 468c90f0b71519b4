//! Settings error types.

use thiserror::Error;

/// Why the MarbleBar settings could not be used.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// `settings.json` exists but could not be read.
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// `settings.json` is not valid JSON, or a field has the wrong type.
    #[error("malformed settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A field parsed but cannot drive a connection, such as an endpoint
    /// that is not `ws://`/`wss://` or a zero connect timeout.
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Dotted path of the offending field, as spelled in the file.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
