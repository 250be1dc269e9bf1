//! Error types for PCAP replay.

use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type surfaced to callers of the replay engine.
#[derive(Error, Debug)]
pub enum Error {
    // Input errors (10-19)
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    // Session errors (20-29)
    #[error("replay already in progress (session {active_session})")]
    Conflict { active_session: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    // Process errors (30-39)
    #[error("failed to launch replay process: {0}")]
    Launch(String),

    #[error("replay failed: {0}")]
    Runtime(String),

    // Storage errors (40-49)
    #[error("history store error: {0}")]
    History(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output.
    pub fn code(&self) -> u32 {
        match self {
            Error::Validation(_) => 10,
            Error::Config(_) => 11,
            Error::Conflict { .. } => 20,
            Error::SessionNotFound { .. } => 21,
            Error::Launch(_) => 30,
            Error::Runtime(_) => 31,
            Error::History(_) => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Whether the caller can reasonably retry after addressing the cause.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Conflict { .. })
    }
}
