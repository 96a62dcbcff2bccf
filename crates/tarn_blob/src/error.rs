//! Error types for blob store operations.

use crate::types::{ObjectId, RecoveryId, TempId};
use std::io;
use thiserror::Error;

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob store operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested object does not exist.
    #[error("no such object: {id}")]
    NoSuchObject {
        /// The object that was not found.
        id: ObjectId,
    },

    /// The temporary token is unknown to this store.
    #[error("no such temporary: {temp}")]
    NoSuchTemporary {
        /// The stale token.
        temp: TempId,
    },

    /// A recoverable temporary with this id already exists.
    #[error("recovery id already in use: {id}")]
    RecoveryIdTaken {
        /// The contended id.
        id: RecoveryId,
    },

    /// Attempted to read beyond the end of a content.
    #[error("read beyond end of content: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current content size.
        size: u64,
    },

    /// The store directory is corrupted or has unexpected contents.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store lock.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,
}

impl BlobError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
