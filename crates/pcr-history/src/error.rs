//! Error types for history operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading or writing history.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error preparing the database location
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A session may only be recorded once
    #[error("history already recorded for session {0}")]
    Duplicate(String),

    /// Database written by an incompatible version
    #[error("unsupported history schema version {found} (supported: {supported})")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// Another thread panicked while holding the connection
    #[error("history connection lock poisoned")]
    LockPoisoned,
}

/// Result type alias for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

impl From<HistoryError> for pcr_common::Error {
    fn from(err: HistoryError) -> Self {
        pcr_common::Error::History(err.to_string())
    }
}
