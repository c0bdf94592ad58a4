//! Error types for procqueue.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the process queue.
#[derive(Debug, Error)]
pub enum QueueError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },

    // Process errors
    #[error("Process launch failed for {command}: {message}")]
    LaunchFailed { command: String, message: String },

    #[error("Process not running: {pid}")]
    ProcessNotRunning { pid: u32 },

    #[error("Failed to terminate process {pid}: {message}")]
    TerminateFailed { pid: u32, message: String },

    #[error("Scheduler is already running")]
    AlreadyRunning,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for procqueue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl QueueError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        QueueError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether the error only concerns a single dispatch and the pool can keep going.
    pub fn is_dispatch_local(&self) -> bool {
        matches!(
            self,
            QueueError::LaunchFailed { .. } | QueueError::InvalidCommand { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::ProcessNotRunning { pid: 4242 };
        assert_eq!(err.to_string(), "Process not running: 4242");
    }

    #[test]
    fn test_io_with_path() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = QueueError::io_with_path(io, "/tmp/settings.json");
        match err {
            QueueError::Io { path, source, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/settings.json")));
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_local_errors() {
        assert!(QueueError::LaunchFailed {
            command: "sync-users".into(),
            message: "No such file".into(),
        }
        .is_dispatch_local());
        assert!(!QueueError::Config {
            message: "limit".into()
        }
        .is_dispatch_local());
    }
}
