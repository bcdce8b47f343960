//! Error types for docket.

use thiserror::Error;

use crate::models::{DocumentId, JobKind};

/// Result type alias using docket's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for docket operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A job is already active for this target and duplicates were not allowed.
    ///
    /// Callers should re-check the target's status rather than retry blindly.
    #[error("Job already active for document {document_id} ({kind})")]
    DuplicateJob {
        document_id: DocumentId,
        kind: JobKind,
    },

    /// Start, poll, or cancel could not reach the job execution service.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The round executor reported a failed optimization round.
    #[error("Round {iteration} failed: {cause}")]
    RoundFailed { iteration: u32, cause: String },

    /// An optimization round did not complete within the configured timeout.
    #[error("Round {iteration} timed out after {timeout_ms}ms")]
    RoundTimeout { iteration: u32, timeout_ms: u64 },

    /// The scheduler instance already has a run in progress.
    #[error("Scheduler is already running")]
    SchedulerBusy,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may reasonably retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::RoundTimeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_duplicate_job() {
        let err = Error::DuplicateJob {
            document_id: "doc-1".to_string(),
            kind: JobKind::Ingestion,
        };
        assert_eq!(
            err.to_string(),
            "Job already active for document doc-1 (ingestion)"
        );
    }

    #[test]
    fn test_error_display_transport() {
        let err = Error::Transport("connection reset".to_string());
        assert_eq!(err.to_string(), "Transport error: connection reset");
    }

    #[test]
    fn test_error_display_round_failed() {
        let err = Error::RoundFailed {
            iteration: 2,
            cause: "2 jobs failed".to_string(),
        };
        assert_eq!(err.to_string(), "Round 2 failed: 2 jobs failed");
    }

    #[test]
    fn test_error_display_round_timeout() {
        let err = Error::RoundTimeout {
            iteration: 4,
            timeout_ms: 1500,
        };
        assert_eq!(err.to_string(), "Round 4 timed out after 1500ms");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("abnormal_slots exceeds batch_size".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: abnormal_slots exceeds batch_size"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::Transport("x".into()).is_retryable());
        assert!(Error::RoundTimeout {
            iteration: 1,
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!Error::SchedulerBusy.is_retryable());
        assert!(!Error::RoundFailed {
            iteration: 1,
            cause: "x".into()
        }
        .is_retryable());
        assert!(!Error::DuplicateJob {
            document_id: "d".into(),
            kind: JobKind::Tagging
        }
        .is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("I/O error:"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
