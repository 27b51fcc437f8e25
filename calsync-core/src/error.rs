//! Error types for calsync.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in calsync operations.
#[derive(Error, Debug)]
pub enum CalSyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Calendar not found: {0}")]
    CalendarNotFound(String),

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("No eligible backend to load collection '{0}'")]
    NoEligibleBackend(String),

    #[error("Backend '{0}' is no longer running")]
    BackendGone(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote request timed out after {0:?}")]
    Timeout(Duration),

    #[error("ICS parse error: {0}")]
    IcsParse(String),

    #[error("ICS generation error: {0}")]
    IcsGenerate(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CalSyncError {
    fn from(e: serde_json::Error) -> Self {
        CalSyncError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for CalSyncError {
    fn from(e: reqwest::Error) -> Self {
        CalSyncError::Transport(e.to_string())
    }
}

/// Result type alias for calsync operations.
pub type CalSyncResult<T> = Result<T, CalSyncError>;
