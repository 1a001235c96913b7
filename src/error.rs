//! WolfMirror Error Types

use thiserror::Error;

use crate::journal::CommitPosition;

/// Result type alias for WolfMirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMirror error types
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // Bootstrap errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // Replay errors
    #[error("Replay fault at {position}: {reason}")]
    ReplayFault {
        position: CommitPosition,
        reason: String,
    },

    #[error("Stale commit: requested {requested} is behind committed {current}")]
    StaleCommit {
        current: CommitPosition,
        requested: CommitPosition,
    },

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Journal errors
    #[error("Journal entry corrupted at {position}: {reason}")]
    JournalCorrupted {
        position: CommitPosition,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by caller policy
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::Busy(_))
    }

    /// Check if an apply failure may succeed when attempted again
    pub fn is_transient_apply_failure(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Check if this is a cancellation outcome rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Short stable name, used in status reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "config",
            Error::NotFound(_) => "not_found",
            Error::RemoteUnavailable(_) => "remote_unavailable",
            Error::AlreadyExists(_) => "already_exists",
            Error::NotConnected(_) => "not_connected",
            Error::Unsupported(_) => "unsupported",
            Error::ReplayFault { .. } => "replay_fault",
            Error::StaleCommit { .. } => "stale_commit",
            Error::Busy(_) => "busy",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::JournalCorrupted { .. } => "journal_corrupted",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
            Error::Cancelled => "cancelled",
            Error::ShuttingDown => "shutting_down",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::RemoteUnavailable("demoted".into()).is_retryable());
        assert!(Error::Busy("snapshot has children".into()).is_transient_apply_failure());
        assert!(!Error::NotFound("journal".into()).is_retryable());
        assert!(Error::Cancelled.is_cancelled());
        assert_eq!(Error::NotConnected("x".into()).kind(), "not_connected");
    }
}
