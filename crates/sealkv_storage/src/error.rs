//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a segment.
    #[error("read beyond end of segment {segment}: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The segment that was read.
        segment: String,
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: u64,
        /// The current segment size.
        size: u64,
    },

    /// A block ref names a segment that does not exist on disk.
    #[error("missing segment file: {0}")]
    MissingSegment(String),

    /// A stored block or ref encoding is malformed.
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// Encryption or decryption failed.
    #[error("cipher error: {0}")]
    Cipher(String),
}

impl StorageError {
    /// Creates a corrupt-block error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptBlock(message.into())
    }

    /// Creates a cipher error.
    pub fn cipher(message: impl Into<String>) -> Self {
        Self::Cipher(message.into())
    }
}
