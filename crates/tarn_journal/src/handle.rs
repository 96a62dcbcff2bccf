//! Durable object and recoverable temporary handles.
//!
//! A handle caches the most recent accepted attribute record and
//! content reference above the blob store. The cache moves forward the
//! moment a transaction is accepted into the journal - possibly before
//! the effects reach the blob store - so readers always observe the
//! latest journaled state.
//!
//! At most one live handle exists per id in a process; reopening an id
//! returns another reference to the existing handle. The journal keeps
//! weak, lookup-only registry entries that the handle's drop glue
//! removes.

use crate::error::{JournalError, JournalResult};
use crate::journal::JournalShared;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tarn_blob::{BlobError, ObjectId, RecoveryId, TempId, TemporaryXattr, Xattr};

pub(crate) struct ObjectState {
    /// Whether the blob-layer object is materialized. False for a
    /// freshly created object until its apply callback runs.
    pub(crate) present: bool,
    pub(crate) cached_xattr: Xattr,
    /// Staged content serving reads until the apply phase lands it.
    pub(crate) staged_content: Option<TempId>,
    pub(crate) generation: u64,
    /// At most one transaction may hold this handle.
    pub(crate) locked: bool,
}

pub(crate) struct ObjectShared {
    pub(crate) journal: Weak<JournalShared>,
    pub(crate) id: ObjectId,
    pub(crate) state: Mutex<ObjectState>,
}

impl Drop for ObjectShared {
    fn drop(&mut self) {
        if let Some(journal) = self.journal.upgrade() {
            let this: *const ObjectShared = self;
            let mut registry = journal.registry.lock();
            if let Some(weak) = registry.objects.get(&self.id) {
                // A replacement handle may already occupy the slot.
                if std::ptr::eq(weak.as_ptr(), this) {
                    registry.objects.remove(&self.id);
                }
            }
        }
    }
}

/// A durable object above the blob store.
///
/// Reads reflect the latest journaled state, which may not yet be the
/// latest applied state. Clones share the same handle.
#[derive(Clone)]
pub struct Object {
    pub(crate) shared: Arc<ObjectShared>,
}

impl Object {
    /// The object's stable id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.shared.id
    }

    /// The most recently journaled attribute record.
    #[must_use]
    pub fn xattr(&self) -> Xattr {
        self.shared.state.lock().cached_xattr
    }

    /// Monotonic counter, advanced by the number of mutating
    /// operations in each accepted transaction.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Reads `len` bytes of the current content starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let (staged, present) = {
            let state = self.shared.state.lock();
            (state.staged_content, state.present)
        };
        let journal = self.shared.journal.upgrade().ok_or(JournalError::Detached)?;
        journal.with_store(|store| {
            if let Some(temp) = staged {
                Ok(store.read_temporary(temp, offset, len)?)
            } else if present {
                Ok(store.read_object(self.shared.id, offset, len)?)
            } else {
                Err(BlobError::NoSuchObject { id: self.shared.id }.into())
            }
        })
    }

    /// Size of the current content in bytes.
    pub fn content_size(&self) -> JournalResult<u64> {
        let (staged, present) = {
            let state = self.shared.state.lock();
            (state.staged_content, state.present)
        };
        let journal = self.shared.journal.upgrade().ok_or(JournalError::Detached)?;
        journal.with_store(|store| {
            if let Some(temp) = staged {
                Ok(store.temporary_size(temp)?)
            } else if present {
                Ok(store.object_size(self.shared.id)?)
            } else {
                Err(BlobError::NoSuchObject { id: self.shared.id }.into())
            }
        })
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Object")
            .field("id", &self.shared.id)
            .field("generation", &state.generation)
            .field("present", &state.present)
            .field("locked", &state.locked)
            .finish_non_exhaustive()
    }
}

pub(crate) struct TemporaryState {
    /// The tagged blob temporary backing this handle, once applied.
    pub(crate) inner: Option<TempId>,
    pub(crate) cached_xattr: TemporaryXattr,
    pub(crate) staged_content: Option<TempId>,
    pub(crate) generation: u64,
    pub(crate) locked: bool,
}

pub(crate) struct TemporaryShared {
    pub(crate) journal: Weak<JournalShared>,
    pub(crate) id: RecoveryId,
    pub(crate) state: Mutex<TemporaryState>,
}

impl Drop for TemporaryShared {
    fn drop(&mut self) {
        // Dropping the handle does not delete the blob temporary: a
        // tagged temporary stays on disk until a transaction consumes
        // it or the next recovery declines to claim it.
        if let Some(journal) = self.journal.upgrade() {
            let this: *const TemporaryShared = self;
            let mut registry = journal.registry.lock();
            if let Some(weak) = registry.temporaries.get(&self.id) {
                if std::ptr::eq(weak.as_ptr(), this) {
                    registry.temporaries.remove(&self.id);
                }
            }
        }
    }
}

/// A recoverable temporary: durable-but-unnamed content addressed by a
/// typed recovery id. Survives restart until explicitly consumed.
///
/// Same read contract as [`Object`].
#[derive(Clone)]
pub struct RecoverableTemporary {
    pub(crate) shared: Arc<TemporaryShared>,
}

impl RecoverableTemporary {
    /// The temporary's recovery id.
    #[must_use]
    pub fn id(&self) -> RecoveryId {
        self.shared.id
    }

    /// The most recently journaled attribute record.
    #[must_use]
    pub fn xattr(&self) -> TemporaryXattr {
        self.shared.state.lock().cached_xattr
    }

    /// Monotonic counter, advanced by the number of mutating
    /// operations in each accepted transaction.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Reads `len` bytes of the current content starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let (staged, inner) = {
            let state = self.shared.state.lock();
            (state.staged_content, state.inner)
        };
        let journal = self.shared.journal.upgrade().ok_or(JournalError::Detached)?;
        journal.with_store(|store| {
            let temp = staged.or(inner).ok_or_else(|| {
                JournalError::invalid_operation("temporary has no content available")
            })?;
            Ok(store.read_temporary(temp, offset, len)?)
        })
    }

    /// Size of the current content in bytes.
    pub fn content_size(&self) -> JournalResult<u64> {
        let (staged, inner) = {
            let state = self.shared.state.lock();
            (state.staged_content, state.inner)
        };
        let journal = self.shared.journal.upgrade().ok_or(JournalError::Detached)?;
        journal.with_store(|store| {
            let temp = staged.or(inner).ok_or_else(|| {
                JournalError::invalid_operation("temporary has no content available")
            })?;
            Ok(store.temporary_size(temp)?)
        })
    }
}

impl std::fmt::Debug for RecoverableTemporary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RecoverableTemporary")
            .field("id", &self.shared.id)
            .field("generation", &state.generation)
            .field("locked", &state.locked)
            .finish_non_exhaustive()
    }
}

// ---- construction ----

/// Opens a durable object, returning the existing live handle when
/// there is one.
pub(crate) fn open_object(
    shared: &Arc<JournalShared>,
    id: ObjectId,
) -> JournalResult<Option<Object>> {
    if let Some(existing) = lookup_object(shared, id) {
        return Ok(Some(existing));
    }

    let Some(xattr) = shared.with_store(|store| Ok(store.open_object(id)?))? else {
        return Ok(None);
    };

    // Another thread may have raced us through the store lookup.
    let mut registry = shared.registry.lock();
    if let Some(existing) = registry.objects.get(&id).and_then(Weak::upgrade) {
        return Ok(Some(Object { shared: existing }));
    }
    let object = Arc::new(ObjectShared {
        journal: Arc::downgrade(shared),
        id,
        state: Mutex::new(ObjectState {
            present: true,
            cached_xattr: xattr,
            staged_content: None,
            generation: 0,
            locked: false,
        }),
    });
    registry.objects.insert(id, Arc::downgrade(&object));
    Ok(Some(Object { shared: object }))
}

pub(crate) fn lookup_object(shared: &Arc<JournalShared>, id: ObjectId) -> Option<Object> {
    let registry = shared.registry.lock();
    registry
        .objects
        .get(&id)
        .and_then(Weak::upgrade)
        .map(|shared| Object { shared })
}

pub(crate) fn lookup_temporary(
    shared: &Arc<JournalShared>,
    id: RecoveryId,
) -> Option<RecoverableTemporary> {
    let registry = shared.registry.lock();
    registry
        .temporaries
        .get(&id)
        .and_then(Weak::upgrade)
        .map(|shared| RecoverableTemporary { shared })
}

/// Registers a brand-new object handle for a create-shaped
/// transaction: not yet materialized, readable through its staged
/// content.
pub(crate) fn create_object_handle(
    shared: &Arc<JournalShared>,
    id: ObjectId,
    xattr: Xattr,
    staged: TempId,
) -> JournalResult<Object> {
    let mut registry = shared.registry.lock();
    if registry.objects.get(&id).and_then(Weak::upgrade).is_some() {
        return Err(JournalError::invalid_operation(format!(
            "object {id} is already open"
        )));
    }
    let object = Arc::new(ObjectShared {
        journal: Arc::downgrade(shared),
        id,
        state: Mutex::new(ObjectState {
            present: false,
            cached_xattr: xattr,
            staged_content: Some(staged),
            generation: 0,
            locked: false,
        }),
    });
    registry.objects.insert(id, Arc::downgrade(&object));
    Ok(Object { shared: object })
}

/// Registers a brand-new temporary handle for a create-shaped
/// transaction.
pub(crate) fn create_temporary_handle(
    shared: &Arc<JournalShared>,
    id: RecoveryId,
    xattr: TemporaryXattr,
    staged: TempId,
) -> JournalResult<RecoverableTemporary> {
    new_temporary_handle(shared, id, xattr, None, Some(staged))
}

/// Registers a handle over an already-tagged blob temporary (claimed
/// from recovery).
pub(crate) fn adopt_temporary(
    shared: &Arc<JournalShared>,
    id: RecoveryId,
    xattr: TemporaryXattr,
    inner: TempId,
) -> JournalResult<RecoverableTemporary> {
    new_temporary_handle(shared, id, xattr, Some(inner), None)
}

fn new_temporary_handle(
    shared: &Arc<JournalShared>,
    id: RecoveryId,
    xattr: TemporaryXattr,
    inner: Option<TempId>,
    staged: Option<TempId>,
) -> JournalResult<RecoverableTemporary> {
    let mut registry = shared.registry.lock();
    if registry
        .temporaries
        .get(&id)
        .and_then(Weak::upgrade)
        .is_some()
    {
        return Err(JournalError::invalid_operation(format!(
            "temporary {id} is already open"
        )));
    }
    let temporary = Arc::new(TemporaryShared {
        journal: Arc::downgrade(shared),
        id,
        state: Mutex::new(TemporaryState {
            inner,
            cached_xattr: xattr,
            staged_content: staged,
            generation: 0,
            locked: false,
        }),
    });
    registry.temporaries.insert(id, Arc::downgrade(&temporary));
    Ok(RecoverableTemporary { shared: temporary })
}

// ---- acceptance & apply glue ----

/// The atomic in-memory commit point for an object: called while the
/// journal records are being written, before the durability sync.
pub(crate) fn update_object(
    object: &Object,
    xattr: Xattr,
    staged: Option<TempId>,
    change_count: u32,
) {
    let mut state = object.shared.state.lock();
    state.generation += u64::from(change_count);
    state.cached_xattr = xattr;
    if staged.is_some() {
        state.staged_content = staged;
    }
}

/// The atomic in-memory commit point for a temporary.
pub(crate) fn update_temporary(
    temporary: &RecoverableTemporary,
    xattr: TemporaryXattr,
    staged: Option<TempId>,
    change_count: u32,
) {
    let mut state = temporary.shared.state.lock();
    state.generation += u64::from(change_count);
    state.cached_xattr = xattr;
    if staged.is_some() {
        state.staged_content = staged;
    }
}

/// Placement landed in the blob store; reads can fall back to it.
pub(crate) fn mark_object_applied(object: &Object, staged: TempId) {
    let mut state = object.shared.state.lock();
    state.present = true;
    // A later transaction may have staged newer content meanwhile.
    if state.staged_content == Some(staged) {
        state.staged_content = None;
    }
}

pub(crate) fn mark_object_removed(object: &Object) {
    let mut state = object.shared.state.lock();
    state.present = false;
    state.staged_content = None;
}

pub(crate) fn mark_temporary_adopted(temporary: &RecoverableTemporary, staged: TempId) {
    let mut state = temporary.shared.state.lock();
    state.inner = Some(staged);
    if state.staged_content == Some(staged) {
        state.staged_content = None;
    }
}

pub(crate) fn mark_temporary_content_applied(temporary: &RecoverableTemporary, staged: TempId) {
    let mut state = temporary.shared.state.lock();
    if state.staged_content == Some(staged) {
        state.staged_content = None;
    }
}

pub(crate) fn temporary_inner(temporary: &RecoverableTemporary) -> Option<TempId> {
    temporary.shared.state.lock().inner
}

pub(crate) fn take_temporary_inner(temporary: &RecoverableTemporary) -> Option<TempId> {
    temporary.shared.state.lock().inner.take()
}
