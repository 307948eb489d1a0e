use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The commit is already part of that station's log.
    #[error("Duplicate commit: {0}")]
    DuplicateCommit(Uuid),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A persisted value could not be parsed back.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// The store's lock was poisoned by a panicking writer.
    #[error("Lock poisoned")]
    Poisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
