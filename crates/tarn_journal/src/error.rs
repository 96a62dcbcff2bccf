//! Error types for the journaling layer.

use tarn_blob::BlobError;
use thiserror::Error;

/// Result type for journaling operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in the journaling layer.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Blob store error.
    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    /// Transaction aborted due to lock contention on a handle.
    ///
    /// Raised synchronously from `wrap`; the caller should drop the
    /// transaction and retry.
    #[error("transaction aborted due to conflict")]
    Conflict,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The handle outlived its journal.
    ///
    /// Happens after the journal has been torn down (for example by
    /// [`crate::Journal::into_store`]) while handles were still alive.
    #[error("handle is detached from its journal")]
    Detached,

    /// The journal was poisoned by an earlier commit failure.
    ///
    /// No further transaction can commit; reads of already-accepted
    /// state keep working. Reopen the store through recovery to
    /// reconcile.
    #[error("journal poisoned by an earlier commit failure; recovery required")]
    Poisoned,

    /// The journal write or sync failed after the transaction was
    /// published in memory.
    ///
    /// The transaction may or may not be durable. The journal is
    /// poisoned; reopen the store through recovery to find out.
    #[error("journal write failed after acceptance (recovery required): {message}")]
    CommitLost {
        /// Description of the failure.
        message: String,
    },

    /// The transaction is durable in the journal but applying it to
    /// the blob store failed.
    ///
    /// **Important:** the caller must NOT retry the transaction - it
    /// is already committed and will be completed by recovery on the
    /// next open. The journal is poisoned.
    #[error("commit accepted but apply failed (recovery required): {message}")]
    CommitPendingRecovery {
        /// Description of the apply failure.
        message: String,
    },

    /// The on-disk journal state is invalid.
    #[error("journal corrupted: {message}")]
    JournalCorrupted {
        /// Description of the corruption.
        message: String,
    },
}

impl JournalError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a commit-lost error.
    pub fn commit_lost(message: impl Into<String>) -> Self {
        Self::CommitLost {
            message: message.into(),
        }
    }

    /// Creates a commit-pending-recovery error.
    pub fn commit_pending_recovery(message: impl Into<String>) -> Self {
        Self::CommitPendingRecovery {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::JournalCorrupted {
            message: message.into(),
        }
    }
}
