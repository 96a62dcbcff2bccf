//! Blob store trait definition.

use crate::error::BlobResult;
use crate::types::{ObjectId, RecoveryId, RecoveryType, TempId, TemporaryXattr, Xattr};

/// A temporary rediscovered during recovery enumeration.
#[derive(Debug, Clone, Copy)]
pub struct RecoveredBlob {
    /// Token for the reopened temporary.
    pub temp: TempId,
    /// The recovery id the temporary was tagged with before the restart.
    pub old_id: RecoveryId,
    /// The attribute record stored alongside the tag.
    pub xattr: TemporaryXattr,
}

/// A low-level blob store for Tarn.
///
/// Blob stores are **opaque byte stores**: they keep durable objects
/// and temporaries, and never interpret their contents. The journaling
/// layer above owns all format interpretation.
///
/// # Invariants
///
/// - [`place_object`](Self::place_object) atomically creates or
///   replaces the target object with the temporary's content; the
///   temporary token is consumed.
/// - [`tag_temporary`](Self::tag_temporary) moves a temporary into the
///   restart-stable recovery namespace; at most one temporary may hold
///   a given [`RecoveryId`].
/// - After [`sync_temporary`](Self::sync_temporary) or
///   [`sync_all`](Self::sync_all) return, the flushed data survives
///   process termination.
/// - [`zero_temporary`](Self::zero_temporary) guarantees that reads of
///   the zeroed range return zeros; implementations should reclaim the
///   underlying blocks where the platform allows.
/// - Stores must be `Send + Sync` for concurrent access.
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing
/// - [`super::DirStore`] - For persistent storage
pub trait BlobStore: Send + Sync {
    // ---- durable objects ----

    /// Looks up an object, returning its attribute record if it exists.
    fn open_object(&self, id: ObjectId) -> BlobResult<Option<Xattr>>;

    /// Reads `len` bytes of an object's content starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not exist or the read
    /// extends past the end of the content.
    fn read_object(&self, id: ObjectId, offset: u64, len: usize) -> BlobResult<Vec<u8>>;

    /// Returns the size of an object's content in bytes.
    fn object_size(&self, id: ObjectId) -> BlobResult<u64>;

    /// Atomically creates or replaces `id` with the content of `content`.
    ///
    /// The temporary token is consumed; any previous content and
    /// attribute record of the object are discarded.
    fn place_object(&mut self, id: ObjectId, xattr: &Xattr, content: TempId) -> BlobResult<()>;

    /// Replaces an existing object's attribute record.
    fn set_object_xattr(&mut self, id: ObjectId, xattr: &Xattr) -> BlobResult<()>;

    /// Removes an object and its content.
    fn remove_object(&mut self, id: ObjectId) -> BlobResult<()>;

    // ---- temporaries ----

    /// Creates a new anonymous temporary with empty content.
    fn new_temporary(&mut self) -> BlobResult<TempId>;

    /// Writes `data` into a temporary at `offset`, extending it as needed.
    fn write_temporary(&mut self, temp: TempId, offset: u64, data: &[u8]) -> BlobResult<()>;

    /// Reads `len` bytes of a temporary's content starting at `offset`.
    fn read_temporary(&self, temp: TempId, offset: u64, len: usize) -> BlobResult<Vec<u8>>;

    /// Returns the size of a temporary's content in bytes.
    fn temporary_size(&self, temp: TempId) -> BlobResult<u64>;

    /// Flushes a temporary's content to durable storage.
    fn sync_temporary(&mut self, temp: TempId) -> BlobResult<()>;

    /// Zeroes `len` bytes of a temporary starting at `offset`.
    ///
    /// Reads of the range return zeros afterwards. Implementations
    /// should punch a hole to reclaim the blocks where supported.
    fn zero_temporary(&mut self, temp: TempId, offset: u64, len: u64) -> BlobResult<()>;

    /// Tags a temporary with a recovery id, moving it into the
    /// restart-stable namespace.
    ///
    /// Re-tagging an already-tagged temporary replaces its id. When
    /// `xattr` is `None` the existing record (or a zeroed one) is kept.
    fn tag_temporary(
        &mut self,
        temp: TempId,
        id: RecoveryId,
        xattr: Option<&TemporaryXattr>,
    ) -> BlobResult<()>;

    /// Replaces `dst`'s content and attribute record with `src`'s
    /// content, consuming `src`. `dst` keeps its recovery tag.
    fn overwrite_temporary(
        &mut self,
        dst: TempId,
        xattr: &TemporaryXattr,
        src: TempId,
    ) -> BlobResult<()>;

    /// Replaces a temporary's attribute record.
    fn set_temporary_xattr(&mut self, temp: TempId, xattr: &TemporaryXattr) -> BlobResult<()>;

    /// Returns a temporary's attribute record.
    fn temporary_xattr(&self, temp: TempId) -> BlobResult<TemporaryXattr>;

    /// Deletes a temporary and its content.
    fn drop_temporary(&mut self, temp: TempId) -> BlobResult<()>;

    // ---- recovery & durability ----

    /// Reopens every temporary tagged with the given recovery type,
    /// in id order.
    ///
    /// Intended for recovery; the returned tokens address the same
    /// on-disk state the process crashed with.
    fn recover_temporaries(&mut self, rtype: RecoveryType) -> BlobResult<Vec<RecoveredBlob>>;

    /// Syncs all store state to durable storage, including namespace
    /// changes (object placement, tags, removals).
    fn sync_all(&mut self) -> BlobResult<()>;
}
