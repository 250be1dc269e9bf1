//! Exit codes for the `pcr` CLI.
//!
//! Exit codes communicate the replay outcome without requiring output parsing.

use pcr_common::{Error, ReplayStatus};

/// Exit codes for pcr operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success / replay completed
    Clean = 0,

    /// Replay process failed
    ReplayFailed = 1,

    /// Replay stopped before completing
    Stopped = 2,

    /// Requested item does not exist
    NotFound = 3,

    /// Invalid replay parameters
    ValidationError = 10,

    /// Configuration error
    ConfigError = 11,

    /// Replay process could not be launched
    LaunchError = 12,

    /// History store error
    HistoryError = 13,

    /// I/O error
    IoError = 14,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Check if this exit code indicates an error requiring attention.
    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Exit code for a session's final status.
    pub fn from_status(status: ReplayStatus) -> Self {
        match status {
            ReplayStatus::Completed => ExitCode::Clean,
            ReplayStatus::Stopped => ExitCode::Stopped,
            ReplayStatus::Failed => ExitCode::ReplayFailed,
            // Not terminal; the CLI only maps finished sessions.
            ReplayStatus::Starting | ReplayStatus::Running | ReplayStatus::Stopping => {
                ExitCode::InternalError
            }
        }
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Validation(_) => ExitCode::ValidationError,
            Error::Config(_) => ExitCode::ConfigError,
            Error::Launch(_) => ExitCode::LaunchError,
            Error::Runtime(_) => ExitCode::ReplayFailed,
            Error::History(_) => ExitCode::HistoryError,
            Error::SessionNotFound { .. } => ExitCode::NotFound,
            Error::Io(_) | Error::Json(_) => ExitCode::IoError,
            Error::Conflict { .. } => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}
