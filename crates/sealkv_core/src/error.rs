//! Error types for the sealkv engine.
//!
//! I/O and format problems surface as [`CoreError`] values. Violated tree
//! invariants are programming errors and panic instead; a query callback
//! returning `false` is normal early termination, not an error.

use sealkv_storage::StorageError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur opening or operating a sealkv database.
#[derive(Debug, Error)]
pub enum CoreError {
    /// `create` was pointed at a directory that already holds files.
    #[error("directory is not empty: {0}")]
    DirNotEmpty(PathBuf),

    /// `open` was pointed at a directory that does not exist.
    #[error("directory not found: {0}")]
    DirNotFound(PathBuf),

    /// The database directory could not be created.
    #[error("unable to create directory: {0}")]
    DirUnableToCreate(PathBuf),

    /// An existing database directory holds no log file.
    #[error("missing log file in: {0}")]
    MissingLogFile(PathBuf),

    /// A block ref names a segment file that is gone.
    #[error("missing segment file: {0}")]
    MissingSegmentFile(String),

    /// The last shutdown was not clean; the newest log does not end with
    /// a `CLOSED` event.
    #[error("recovery required: log does not end with a clean close")]
    RecoveryRequired,

    /// Another process holds the database lock.
    #[error("database locked: another process has exclusive access")]
    Locked,

    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// A stored node record is malformed.
    #[error("corrupt node record: {0}")]
    CorruptNode(String),

    /// A log line or log projection is malformed.
    #[error("corrupt log: {0}")]
    CorruptLog(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates a corrupt-node error.
    pub fn corrupt_node(message: impl Into<String>) -> Self {
        Self::CorruptNode(message.into())
    }

    /// Creates a corrupt-log error.
    pub fn corrupt_log(message: impl Into<String>) -> Self {
        Self::CorruptLog(message.into())
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            // Keep the missing-segment code visible at the surface.
            StorageError::MissingSegment(name) => Self::MissingSegmentFile(name),
            other => Self::Storage(other),
        }
    }
}
