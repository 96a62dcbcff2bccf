//! # Tarn Journal
//!
//! A write-ahead journaling layer that sits atop a blob store
//! ([`tarn_blob`]) and provides atomic, durable, multi-object
//! transactions with crash recovery.
//!
//! The layer exposes durable [`Object`]s (identified by stable ids)
//! and [`RecoverableTemporary`]s (identified by typed recovery ids),
//! and lets a client batch changes to any number of them into a single
//! [`Transaction`] whose effects either all become visible after a
//! crash or none do.
//!
//! ## Commit Protocol
//!
//! 1. Pending content is staged into the blob store's recovery
//!    namespace and one fixed-size record per changed handle is built,
//!    chained by a descending per-record counter.
//! 2. The new state is published on the handles: readers observe it
//!    from the moment the transaction is accepted.
//! 3. The records are appended to the journal file and fsynced - the
//!    durability barrier.
//! 4. The effects are applied to the blob store, a second sync makes
//!    them durable, and the consumed journal region is punched out.
//!
//! Apply phases of concurrent commits run strictly in commit order.
//! A failure after acceptance poisons the journal
//! ([`JournalError::CommitPendingRecovery`]); the next open replays
//! the journal and converges.
//!
//! ## Recovery
//!
//! [`Recovery`] enumerates leftover staging and typed temporaries,
//! replays the valid prefix of the journal, lets callers claim what
//! they recognize, and garbage-collects the rest.
//!
//! ```rust
//! use tarn_blob::{MemoryStore, ObjectId, Xattr};
//! use tarn_journal::{Journal, JournalConfig};
//!
//! # fn main() -> tarn_journal::JournalResult<()> {
//! let journal = Journal::open(Box::new(MemoryStore::new()), JournalConfig::default())?;
//!
//! let mut txn = journal.begin();
//! let content = journal.new_detached_temporary()?;
//! content.write_at(0, b"hello")?;
//! let (object, _locked) = txn.create_object(ObjectId::new(1), Xattr::zeroed(), content)?;
//! txn.commit(None)?;
//!
//! assert_eq!(object.read_at(0, 5)?, b"hello");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod entry;
mod error;
mod handle;
mod journal;
mod recovery;
mod transaction;

pub use config::JournalConfig;
pub use entry::{EntryKind, EntryTarget, JournalEntry, ENTRY_SIZE};
pub use error::{JournalError, JournalResult};
pub use handle::{Object, RecoverableTemporary};
pub use journal::{DetachedTemporary, Journal};
pub use recovery::{RecoveredTemporary, Recovery};
pub use transaction::{LockedObject, LockedTemporary, Transaction};

pub use tarn_blob::{
    BlobStore, ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr, XATTR_LEN,
};
