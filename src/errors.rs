//! Error types
//!
//! Per-image failures are values, not unwinding: every stage returns a
//! `Result` and the batch collector folds the error kind into the
//! success/fail/exception counters.

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineInstanceKey;

/// Failures raised by a recognition-engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine construction failed: {0}")]
    Construction(String),

    #[error("Engine configuration rejected: {0}")]
    Configuration(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Malformed engine output: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while processing a single image.
#[derive(Debug, Error)]
pub enum DetectError {
    /// File missing, corrupt or undecodable. Counted as `fail`.
    #[error("Cannot read image {path:?}: {message}")]
    ImageRead { path: PathBuf, message: String },

    /// No engine handle could be built for a key. Counted as `exception`.
    #[error("Engine init failed for {key}: {source}")]
    EngineInit {
        key: EngineInstanceKey,
        #[source]
        source: EngineError,
    },

    /// The inference call raised. The round is treated as a miss.
    #[error("Round {round} failed: {source}")]
    RoundExecution {
        round: usize,
        #[source]
        source: EngineError,
    },

    /// Unexpected failure inside a worker (including caught panics).
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl DetectError {
    /// Whether the collector counts this error as `fail` rather than `exception`
    pub fn is_read_failure(&self) -> bool {
        matches!(self, DetectError::ImageRead { .. })
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Result not found: {0}")]
    ResultNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage result alias
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_failure_classification() {
        let read = DetectError::ImageRead {
            path: PathBuf::from("missing.png"),
            message: "not found".to_string(),
        };
        assert!(read.is_read_failure());

        let init = DetectError::EngineInit {
            key: EngineInstanceKey::new("ch", false, false),
            source: EngineError::Construction("no model".to_string()),
        };
        assert!(!init.is_read_failure());
        assert!(!DetectError::Unexpected("boom".to_string()).is_read_failure());
    }

    #[test]
    fn test_error_messages_name_the_key() {
        let init = DetectError::EngineInit {
            key: EngineInstanceKey::new("japan", true, false),
            source: EngineError::Construction("no model".to_string()),
        };
        let message = init.to_string();
        assert!(message.contains("japan"));
        assert!(message.contains("no model"));
    }
}
