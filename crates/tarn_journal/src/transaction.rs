//! Transactions and locked handles.
//!
//! A transaction collects exclusive locks over object and temporary
//! handles, buffers mutations against them, and turns the whole set
//! into one atomic journal append on commit. Until commit, all pending
//! state lives in the locks; dropping the transaction aborts it and
//! releases everything.

use crate::entry::{EntryKind, EntryTarget, JournalEntry};
use crate::error::{JournalError, JournalResult};
use crate::handle::{self, Object, RecoverableTemporary};
use crate::journal::{ApplyOp, DetachedTemporary, Journal, JournalShared};
use parking_lot::Mutex;
use std::sync::Arc;
use tarn_blob::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr};

struct LockedObjectState {
    created: bool,
    removed: bool,
    change_count: u32,
    new_xattr: Option<Xattr>,
    new_content: Option<DetachedTemporary>,
    committed: bool,
}

pub(crate) struct LockedObjectInner {
    object: Object,
    state: Mutex<LockedObjectState>,
}

impl LockedObjectInner {
    fn acquire(
        object: &Object,
        created: bool,
        content: Option<DetachedTemporary>,
    ) -> JournalResult<Arc<Self>> {
        {
            let mut state = object.shared.state.lock();
            if state.locked {
                return Err(JournalError::Conflict);
            }
            state.locked = true;
        }
        Ok(Arc::new(Self {
            object: object.clone(),
            state: Mutex::new(LockedObjectState {
                created,
                // Creation itself is a mutation: a create-shaped lock
                // with no further calls still journals one record.
                change_count: u32::from(created),
                removed: false,
                new_xattr: None,
                new_content: content,
                committed: false,
            }),
        }))
    }

    fn check_mutable(state: &LockedObjectState) -> JournalResult<()> {
        if state.committed {
            return Err(JournalError::invalid_operation(
                "locked handle used after commit",
            ));
        }
        Ok(())
    }

    /// Stages pending content and produces this lock's journal record,
    /// or `None` for a no-op lock.
    pub(crate) fn build_entry(&self, shared: &JournalShared) -> JournalResult<Option<JournalEntry>> {
        let state = self.state.lock();
        if state.change_count == 0 || (state.created && state.removed) {
            return Ok(None);
        }

        let mut staging_id = 0;
        if let Some(temp) = state.new_content.as_ref().and_then(DetachedTemporary::peek) {
            staging_id = shared.alloc_staging_id();
            shared.with_store(|store| {
                Ok(store.tag_temporary(
                    temp,
                    RecoveryId::new(RecoveryType::Staging, staging_id),
                    None,
                )?)
            })?;
        }

        let xattr = state.new_xattr.unwrap_or_else(|| self.object.xattr());
        let kind = if state.created {
            EntryKind::CreateObject
        } else if state.removed {
            EntryKind::DeleteObject
        } else if state.new_content.is_none() {
            EntryKind::UpdateXattr
        } else {
            EntryKind::UpdateObject
        };

        Ok(Some(JournalEntry {
            kind,
            tx_size: 0, // back-filled once the transaction is complete
            staging_id,
            target: EntryTarget::Object {
                id: self.object.id(),
                xattr,
            },
        }))
    }

    /// Publishes the accepted state on the handle and returns the
    /// deferred blob-store effect, or `None` for a no-op lock.
    pub(crate) fn publish(&self) -> Option<ApplyOp> {
        let mut state = self.state.lock();
        state.committed = true;
        if state.change_count == 0 || (state.created && state.removed) {
            return None;
        }

        let xattr = state.new_xattr.take().unwrap_or_else(|| self.object.xattr());
        if state.removed {
            // Pending content, if any, stays owned here; it is deleted
            // when the lock is dropped.
            handle::update_object(&self.object, xattr, None, state.change_count);
            return Some(ApplyOp::RemoveObject {
                object: self.object.clone(),
            });
        }

        let staged = state.new_content.take().and_then(DetachedTemporary::into_temp);
        handle::update_object(&self.object, xattr, staged, state.change_count);
        match staged {
            Some(temp) => Some(ApplyOp::PlaceObject {
                object: self.object.clone(),
                xattr,
                staged: temp,
            }),
            None => Some(ApplyOp::SetObjectXattr {
                object: self.object.clone(),
                xattr,
            }),
        }
    }
}

impl Drop for LockedObjectInner {
    fn drop(&mut self) {
        self.object.shared.state.lock().locked = false;
    }
}

/// An object locked into a transaction.
///
/// Reads prefer the pending mutation state and fall back to the
/// underlying handle. All mutators are buffered until commit.
pub struct LockedObject {
    inner: Arc<LockedObjectInner>,
}

impl LockedObject {
    /// Replaces the object's content and attribute record.
    pub fn overwrite(&self, xattr: Xattr, content: DetachedTemporary) -> JournalResult<()> {
        let mut state = self.inner.state.lock();
        LockedObjectInner::check_mutable(&state)?;
        state.change_count += 1;
        state.new_xattr = Some(xattr);
        state.new_content = Some(content);
        Ok(())
    }

    /// Replaces the object's attribute record.
    pub fn set_xattr(&self, xattr: Xattr) -> JournalResult<()> {
        let mut state = self.inner.state.lock();
        LockedObjectInner::check_mutable(&state)?;
        state.change_count += 1;
        state.new_xattr = Some(xattr);
        Ok(())
    }

    /// Marks the object for removal.
    pub fn remove(&self) -> JournalResult<()> {
        let mut state = self.inner.state.lock();
        LockedObjectInner::check_mutable(&state)?;
        state.change_count += 1;
        state.removed = true;
        Ok(())
    }

    /// The pending attribute record, falling back to the handle's.
    #[must_use]
    pub fn xattr(&self) -> Xattr {
        let state = self.inner.state.lock();
        state.new_xattr.unwrap_or_else(|| self.inner.object.xattr())
    }

    /// The generation the object will have once this transaction is
    /// accepted.
    #[must_use]
    pub fn generation(&self) -> u64 {
        let state = self.inner.state.lock();
        self.inner.object.generation() + u64::from(state.change_count)
    }

    /// Reads from the pending content, falling back to the handle's.
    pub fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let state = self.inner.state.lock();
        if let Some(content) = &state.new_content {
            content.read_at(offset, len)
        } else {
            drop(state);
            self.inner.object.read_at(offset, len)
        }
    }

    /// Size of the pending or current content.
    pub fn content_size(&self) -> JournalResult<u64> {
        let state = self.inner.state.lock();
        if let Some(content) = &state.new_content {
            content.size()
        } else {
            drop(state);
            self.inner.object.content_size()
        }
    }
}

struct LockedTemporaryState {
    created: bool,
    removed: bool,
    change_count: u32,
    new_xattr: Option<TemporaryXattr>,
    new_content: Option<DetachedTemporary>,
    committed: bool,
}

pub(crate) struct LockedTemporaryInner {
    temporary: RecoverableTemporary,
    state: Mutex<LockedTemporaryState>,
}

impl LockedTemporaryInner {
    fn acquire(
        temporary: &RecoverableTemporary,
        created: bool,
        content: Option<DetachedTemporary>,
    ) -> JournalResult<Arc<Self>> {
        {
            let mut state = temporary.shared.state.lock();
            if state.locked {
                return Err(JournalError::Conflict);
            }
            state.locked = true;
        }
        Ok(Arc::new(Self {
            temporary: temporary.clone(),
            state: Mutex::new(LockedTemporaryState {
                created,
                change_count: u32::from(created),
                removed: false,
                new_xattr: None,
                new_content: content,
                committed: false,
            }),
        }))
    }

    /// Locks a temporary for consumption: committed alongside the rest
    /// of the transaction as a removal.
    pub(crate) fn consume(temporary: RecoverableTemporary) -> JournalResult<Arc<Self>> {
        let inner = Self::acquire(&temporary, false, None)?;
        {
            let mut state = inner.state.lock();
            state.removed = true;
            state.change_count = 1;
        }
        Ok(inner)
    }

    fn check_mutable(state: &LockedTemporaryState) -> JournalResult<()> {
        if state.committed {
            return Err(JournalError::invalid_operation(
                "locked handle used after commit",
            ));
        }
        Ok(())
    }

    pub(crate) fn build_entry(&self, shared: &JournalShared) -> JournalResult<Option<JournalEntry>> {
        let state = self.state.lock();
        if state.change_count == 0 || (state.created && state.removed) {
            return Ok(None);
        }

        let mut staging_id = 0;
        if let Some(temp) = state.new_content.as_ref().and_then(DetachedTemporary::peek) {
            staging_id = shared.alloc_staging_id();
            shared.with_store(|store| {
                Ok(store.tag_temporary(
                    temp,
                    RecoveryId::new(RecoveryType::Staging, staging_id),
                    None,
                )?)
            })?;
        }

        let xattr = state
            .new_xattr
            .unwrap_or_else(|| self.temporary.xattr());
        let kind = if state.created {
            EntryKind::CreateTemporary
        } else if state.removed {
            EntryKind::DeleteTemporary
        } else if state.new_content.is_none() {
            EntryKind::UpdateTemporaryXattr
        } else {
            EntryKind::UpdateTemporary
        };

        Ok(Some(JournalEntry {
            kind,
            tx_size: 0,
            staging_id,
            target: EntryTarget::Temporary {
                id: self.temporary.id(),
                xattr,
            },
        }))
    }

    pub(crate) fn publish(&self) -> Option<ApplyOp> {
        let mut state = self.state.lock();
        state.committed = true;
        if state.change_count == 0 || (state.created && state.removed) {
            return None;
        }

        let xattr = state
            .new_xattr
            .take()
            .unwrap_or_else(|| self.temporary.xattr());
        if state.removed {
            handle::update_temporary(&self.temporary, xattr, None, state.change_count);
            return Some(ApplyOp::ReleaseTemporary {
                handle: self.temporary.clone(),
            });
        }

        let staged = state.new_content.take().and_then(DetachedTemporary::into_temp);
        handle::update_temporary(&self.temporary, xattr, staged, state.change_count);
        match (state.created, staged) {
            (true, Some(temp)) => Some(ApplyOp::AdoptTemporary {
                handle: self.temporary.clone(),
                xattr,
                staged: temp,
            }),
            (false, Some(temp)) => Some(ApplyOp::OverwriteTemporary {
                handle: self.temporary.clone(),
                xattr,
                staged: temp,
            }),
            (_, None) => Some(ApplyOp::SetTemporaryXattr {
                handle: self.temporary.clone(),
                xattr,
            }),
        }
    }
}

impl Drop for LockedTemporaryInner {
    fn drop(&mut self) {
        self.temporary.shared.state.lock().locked = false;
    }
}

/// A recoverable temporary locked into a transaction.
pub struct LockedTemporary {
    inner: Arc<LockedTemporaryInner>,
}

impl LockedTemporary {
    /// Replaces the temporary's content and attribute record.
    pub fn overwrite(&self, xattr: TemporaryXattr, content: DetachedTemporary) -> JournalResult<()> {
        let mut state = self.inner.state.lock();
        LockedTemporaryInner::check_mutable(&state)?;
        state.change_count += 1;
        state.new_xattr = Some(xattr);
        state.new_content = Some(content);
        Ok(())
    }

    /// Replaces the temporary's attribute record.
    pub fn set_xattr(&self, xattr: TemporaryXattr) -> JournalResult<()> {
        let mut state = self.inner.state.lock();
        LockedTemporaryInner::check_mutable(&state)?;
        state.change_count += 1;
        state.new_xattr = Some(xattr);
        Ok(())
    }

    /// Marks the temporary for removal.
    pub fn remove(&self) -> JournalResult<()> {
        let mut state = self.inner.state.lock();
        LockedTemporaryInner::check_mutable(&state)?;
        state.change_count += 1;
        state.removed = true;
        Ok(())
    }

    /// The pending attribute record, falling back to the handle's.
    #[must_use]
    pub fn xattr(&self) -> TemporaryXattr {
        let state = self.inner.state.lock();
        state
            .new_xattr
            .unwrap_or_else(|| self.inner.temporary.xattr())
    }

    /// The generation the temporary will have once this transaction is
    /// accepted.
    #[must_use]
    pub fn generation(&self) -> u64 {
        let state = self.inner.state.lock();
        self.inner.temporary.generation() + u64::from(state.change_count)
    }

    /// Reads from the pending content, falling back to the handle's.
    pub fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let state = self.inner.state.lock();
        if let Some(content) = &state.new_content {
            content.read_at(offset, len)
        } else {
            drop(state);
            self.inner.temporary.read_at(offset, len)
        }
    }
}

/// A batch of changes that commits atomically.
///
/// Handles are locked into the transaction by [`wrap`](Self::wrap) and
/// [`wrap_temporary`](Self::wrap_temporary) or born locked via the
/// `create_*` methods. Dropping the transaction without committing
/// aborts it; locks release once both the transaction and any
/// caller-held locked handles are gone.
pub struct Transaction {
    journal: Journal,
    objects: Vec<Arc<LockedObjectInner>>,
    temporaries: Vec<Arc<LockedTemporaryInner>>,
}

impl Transaction {
    pub(crate) fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            objects: Vec::new(),
            temporaries: Vec::new(),
        }
    }

    /// Locks an object into this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Conflict`] if another transaction holds
    /// the handle; drop this transaction and retry.
    pub fn wrap(&mut self, object: &Object) -> JournalResult<LockedObject> {
        let inner = LockedObjectInner::acquire(object, false, None)?;
        self.objects.push(Arc::clone(&inner));
        Ok(LockedObject { inner })
    }

    /// Locks a recoverable temporary into this transaction.
    pub fn wrap_temporary(
        &mut self,
        temporary: &RecoverableTemporary,
    ) -> JournalResult<LockedTemporary> {
        let inner = LockedTemporaryInner::acquire(temporary, false, None)?;
        self.temporaries.push(Arc::clone(&inner));
        Ok(LockedTemporary { inner })
    }

    /// Creates a new object within this transaction.
    ///
    /// The returned handle is immediately visible to
    /// [`Journal::open_object`] and readable through its staged
    /// content, even before commit.
    pub fn create_object(
        &mut self,
        id: ObjectId,
        xattr: Xattr,
        content: DetachedTemporary,
    ) -> JournalResult<(Object, LockedObject)> {
        let staged = content.peek().ok_or_else(|| {
            JournalError::invalid_operation("detached temporary already consumed")
        })?;
        let object = handle::create_object_handle(&self.journal.shared, id, xattr, staged)?;
        let inner = LockedObjectInner::acquire(&object, true, Some(content))?;
        self.objects.push(Arc::clone(&inner));
        Ok((object, LockedObject { inner }))
    }

    /// Creates a new recoverable temporary within this transaction.
    ///
    /// `Staging` and `Journal` recovery types are reserved. The id
    /// must not be in use, on disk or as a live handle; recovery id
    /// allocation belongs to the caller.
    pub fn create_recoverable_temporary(
        &mut self,
        id: RecoveryId,
        xattr: TemporaryXattr,
        content: DetachedTemporary,
    ) -> JournalResult<(RecoverableTemporary, LockedTemporary)> {
        if matches!(id.rtype, RecoveryType::Staging | RecoveryType::Journal) {
            return Err(JournalError::invalid_operation(format!(
                "recovery type {} is reserved for the journal",
                id.rtype
            )));
        }
        let staged = content.peek().ok_or_else(|| {
            JournalError::invalid_operation("detached temporary already consumed")
        })?;
        let temporary =
            handle::create_temporary_handle(&self.journal.shared, id, xattr, staged)?;
        let inner = LockedTemporaryInner::acquire(&temporary, true, Some(content))?;
        self.temporaries.push(Arc::clone(&inner));
        Ok((temporary, LockedTemporary { inner }))
    }

    /// Commits the transaction.
    ///
    /// `consume`, if given, is removed atomically with the rest of the
    /// batch. Returns once the journal records are durable *and* the
    /// effects have been applied to the blob store; readers through
    /// the handles observe the new state earlier, from the moment of
    /// acceptance.
    pub fn commit(self, consume: Option<RecoverableTemporary>) -> JournalResult<()> {
        let Self {
            journal,
            objects,
            mut temporaries,
        } = self;
        if let Some(temporary) = consume {
            temporaries.push(LockedTemporaryInner::consume(temporary)?);
        }
        journal.commit_lockeds(&objects, &temporaries)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("objects", &self.objects.len())
            .field("temporaries", &self.temporaries.len())
            .finish()
    }
}
