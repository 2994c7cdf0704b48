//! Error types for the store module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the backing store.
///
/// Every variant means the version store, queue or lock could not be
/// reached or used. Loops log it and drop the single operation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),

    /// A stored record or queued item could not be encoded or decoded.
    #[error("Invalid stored payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StoreError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
