//! Error types for TravelerHub

use thiserror::Error;

/// Main error type for TravelerHub operations
#[derive(Error, Debug)]
pub enum HubError {
    /// Credential rejected, OAuth cancelled or failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An operation needed a signed-in identity and there was none
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Remote query failed (malformed filter, network failure, row not found)
    #[error("Query error: {0}")]
    Query(String),

    /// Remote write failed (constraint violation, rejected row)
    #[error("Write error: {0}")]
    Write(String),

    /// Realtime channel could not be opened or tracked
    #[error("Channel error: {0}")]
    Channel(String),

    /// Error during local storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization(err.to_string())
    }
}

/// Result type alias using HubError
pub type HubResult<T> = Result<T, HubError>;
