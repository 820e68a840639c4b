//! Unified error types for history storage operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during history storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error against the backing medium (unavailable, full, ...).
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error serializing or deserializing a stored record.
    #[error("storage serialization error: {0}")]
    Serialization(String),

    /// Referenced entity does not exist.
    #[error("session not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl ToString) -> Self {
        Self::Serialization(message.to_string())
    }

    /// Whether retrying the failed operation can succeed.
    ///
    /// Medium errors are transient; a missing entity is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Convenience type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
