//! Error types for object storage.

use thiserror::Error;

/// Result type alias for object storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing objects.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open object store: {0}")]
    Open(String),

    #[error("invalid object store url {0:?}")]
    InvalidUrl(String),

    #[error("invalid object path {0:?}")]
    InvalidPath(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    /// Transient failure; the retry layer tries again before surfacing it.
    #[error("transient I/O error: {0}")]
    IoTransient(String),

    #[error("object not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::IoTransient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Classify a filesystem error for `path`.
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => StorageError::IoTransient(format!("{path}: {err}")),
            _ => StorageError::Write(format!("{path}: {err}")),
        }
    }
}
