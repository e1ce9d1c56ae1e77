//! Error types for the ledger crate.

use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Storage(format!("redb error: {e}"))
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(format!("redb database error: {e}"))
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(format!("redb transaction error: {e}"))
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(format!("redb table error: {e}"))
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(format!("redb storage error: {e}"))
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(format!("redb commit error: {e}"))
    }
}

impl From<Error> for hivelink_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(s) => hivelink_core::Error::Validation(s),
            Error::Serialization(s) => hivelink_core::Error::Serialization(s),
            other => hivelink_core::Error::Storage(other.to_string()),
        }
    }
}
