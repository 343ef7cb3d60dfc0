//! Error types for the ledger module.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// The store is busy or locked; the operation may succeed if retried.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// The store cannot serve requests at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Payload serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The write itself is inconsistent (kind mismatch, unresolved reference).
    #[error("invalid write: {0}")]
    InvalidWrite(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Whether the same operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                LedgerError::Transient(e.to_string())
            }
            _ => LedgerError::Database(e),
        }
    }
}

impl From<preventa_core::ValidationError> for LedgerError {
    fn from(e: preventa_core::ValidationError) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
