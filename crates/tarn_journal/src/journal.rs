//! The running journal: write queue, commit pipeline, handle registries.

use crate::config::JournalConfig;
use crate::entry::encode_entries;
use crate::error::{JournalError, JournalResult};
use crate::handle::{self, Object, ObjectShared, RecoverableTemporary, TemporaryShared};
use crate::recovery::{RecoveredTemporary, Recovery};
use crate::transaction::{LockedObjectInner, LockedTemporaryInner, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tarn_blob::{
    BlobStore, ObjectId, RecoveryId, RecoveryType, TempId, TemporaryXattr, Xattr,
};
use tracing::{debug, error};

/// Mutable journal bookkeeping, guarded by one mutex.
pub(crate) struct JournalState {
    /// The journal file. `None` only while recovery is in progress.
    pub(crate) journal_temp: Option<TempId>,
    /// Next free byte offset in the journal file.
    pub(crate) position: u64,
    /// Next staging id; allocated per staged content, restarts at zero
    /// with every fresh journal.
    pub(crate) staging_counter: u64,
    /// Set when a commit failed past the point of no return.
    pub(crate) poisoned: bool,
}

/// Weak, lookup-only maps of live handles.
///
/// Entries are inserted at handle construction and removed by the
/// handle's drop glue; the journal never keeps a handle alive.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) objects: HashMap<ObjectId, Weak<ObjectShared>>,
    pub(crate) temporaries: HashMap<RecoveryId, Weak<TemporaryShared>>,
}

/// State shared between the journal, recovery, and every handle.
pub(crate) struct JournalShared {
    /// The blob store underneath. Taken out by [`Journal::into_store`],
    /// after which handles report [`JournalError::Detached`].
    pub(crate) store: Mutex<Option<Box<dyn BlobStore>>>,
    pub(crate) state: Mutex<JournalState>,
    pub(crate) registry: Mutex<Registry>,
    /// The write queue. Commits serialize here, so apply phases run
    /// strictly in commit order across threads.
    pub(crate) queue: Mutex<()>,
    pub(crate) config: JournalConfig,
}

impl JournalShared {
    /// Runs `f` with exclusive access to the blob store.
    ///
    /// Never call while already holding the store lock.
    pub(crate) fn with_store<R>(
        &self,
        f: impl FnOnce(&mut dyn BlobStore) -> JournalResult<R>,
    ) -> JournalResult<R> {
        let mut guard = self.store.lock();
        let store = guard.as_mut().ok_or(JournalError::Detached)?;
        f(&mut **store)
    }

    pub(crate) fn alloc_staging_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.staging_counter;
        state.staging_counter += 1;
        id
    }
}

/// One deferred blob-store effect of a committed transaction.
///
/// Built while the transaction is published in memory; executed after
/// the journal records are durable. Each op owns everything it needs,
/// including the handle whose cached state it completes.
pub(crate) enum ApplyOp {
    /// Move staged content into its final object slot (create and
    /// update converge here: placement is create-or-replace).
    PlaceObject {
        object: Object,
        xattr: Xattr,
        staged: TempId,
    },
    RemoveObject {
        object: Object,
    },
    SetObjectXattr {
        object: Object,
        xattr: Xattr,
    },
    /// Tag a created temporary's staged content with its recovery id.
    AdoptTemporary {
        handle: RecoverableTemporary,
        xattr: TemporaryXattr,
        staged: TempId,
    },
    OverwriteTemporary {
        handle: RecoverableTemporary,
        xattr: TemporaryXattr,
        staged: TempId,
    },
    SetTemporaryXattr {
        handle: RecoverableTemporary,
        xattr: TemporaryXattr,
    },
    /// Delete the blob temporary behind a removed handle.
    ReleaseTemporary {
        handle: RecoverableTemporary,
    },
}

impl ApplyOp {
    /// Executes the effect against the blob store and completes the
    /// owning handle's cached state.
    fn run(self, store: &mut dyn BlobStore) -> JournalResult<()> {
        match self {
            Self::PlaceObject {
                object,
                xattr,
                staged,
            } => {
                store.place_object(object.id(), &xattr, staged)?;
                handle::mark_object_applied(&object, staged);
            }
            Self::RemoveObject { object } => {
                store.remove_object(object.id())?;
                handle::mark_object_removed(&object);
            }
            Self::SetObjectXattr { object, xattr } => {
                store.set_object_xattr(object.id(), &xattr)?;
            }
            Self::AdoptTemporary {
                handle,
                xattr,
                staged,
            } => {
                store.tag_temporary(staged, handle.id(), Some(&xattr))?;
                handle::mark_temporary_adopted(&handle, staged);
            }
            Self::OverwriteTemporary {
                handle,
                xattr,
                staged,
            } => {
                let inner = handle::temporary_inner(&handle).ok_or_else(|| {
                    JournalError::invalid_operation("overwrite of a temporary with no backing blob")
                })?;
                store.overwrite_temporary(inner, &xattr, staged)?;
                handle::mark_temporary_content_applied(&handle, staged);
            }
            Self::SetTemporaryXattr { handle, xattr } => {
                if let Some(inner) = handle::temporary_inner(&handle) {
                    store.set_temporary_xattr(inner, &xattr)?;
                }
            }
            Self::ReleaseTemporary { handle } => {
                if let Some(inner) = handle::take_temporary_inner(&handle) {
                    store.drop_temporary(inner)?;
                }
            }
        }
        Ok(())
    }
}

/// Writable, unstaged content destined for a transaction.
///
/// Created by [`Journal::new_detached_temporary`] and handed to
/// [`crate::Transaction::create_object`],
/// [`crate::Transaction::create_recoverable_temporary`], or a locked
/// handle's `overwrite`. Dropping it without committing deletes the
/// underlying blob temporary.
///
/// There is deliberately no way to assign a recovery id to one of
/// these; durable temporaries are only minted through
/// [`crate::Transaction::create_recoverable_temporary`].
pub struct DetachedTemporary {
    journal: Weak<JournalShared>,
    temp: Option<TempId>,
}

impl DetachedTemporary {
    pub(crate) fn new(journal: Weak<JournalShared>, temp: TempId) -> Self {
        Self {
            journal,
            temp: Some(temp),
        }
    }

    fn temp_id(&self) -> JournalResult<TempId> {
        self.temp.ok_or_else(|| {
            JournalError::invalid_operation("detached temporary already consumed")
        })
    }

    /// Writes `data` at `offset`, extending the content as needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> JournalResult<()> {
        let temp = self.temp_id()?;
        let shared = self.journal.upgrade().ok_or(JournalError::Detached)?;
        shared.with_store(|store| Ok(store.write_temporary(temp, offset, data)?))
    }

    /// Reads `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let temp = self.temp_id()?;
        let shared = self.journal.upgrade().ok_or(JournalError::Detached)?;
        shared.with_store(|store| Ok(store.read_temporary(temp, offset, len)?))
    }

    /// Current content size in bytes.
    pub fn size(&self) -> JournalResult<u64> {
        let temp = self.temp_id()?;
        let shared = self.journal.upgrade().ok_or(JournalError::Detached)?;
        shared.with_store(|store| Ok(store.temporary_size(temp)?))
    }

    /// The underlying blob token, while not yet consumed.
    pub(crate) fn peek(&self) -> Option<TempId> {
        self.temp
    }

    /// Consumes the wrapper without deleting the blob temporary.
    pub(crate) fn into_temp(mut self) -> Option<TempId> {
        self.temp.take()
    }
}

impl Drop for DetachedTemporary {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            if let Some(shared) = self.journal.upgrade() {
                let _ = shared.with_store(|store| Ok(store.drop_temporary(temp)?));
            }
        }
    }
}

/// The journaling layer's entry point: a durable, transactional view
/// over a blob store.
///
/// A `Journal` is only constructed through recovery ([`Journal::open`]
/// or [`crate::Recovery`]), which replays whatever the previous run
/// left behind. Clones share the same underlying journal.
///
/// # Example
///
/// ```rust,ignore
/// let journal = Journal::open(Box::new(store), JournalConfig::default())?;
/// let mut txn = journal.begin();
/// let content = journal.new_detached_temporary()?;
/// content.write_at(0, b"hello")?;
/// let (_object, _locked) = txn.create_object(ObjectId::new(1), xattr, content)?;
/// txn.commit(None)?;
/// ```
#[derive(Clone)]
pub struct Journal {
    pub(crate) shared: Arc<JournalShared>,
}

impl Journal {
    /// Opens a journal over the given store, running recovery first.
    ///
    /// Convenience for `Recovery::new(store, config)?.finish()`; use
    /// [`Recovery`] directly to claim recovered temporaries.
    pub fn open(store: Box<dyn BlobStore>, config: JournalConfig) -> JournalResult<Self> {
        Recovery::new(store, config)?.finish()
    }

    /// Begins a new transaction.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction::new(self)
    }

    /// Opens a durable object.
    ///
    /// If a handle for `id` is already live in this process, the same
    /// handle is returned and the blob store is not consulted.
    pub fn open_object(&self, id: ObjectId) -> JournalResult<Option<Object>> {
        handle::open_object(&self.shared, id)
    }

    /// Looks up a live recoverable-temporary handle by id.
    ///
    /// This is registry-only: temporaries that exist on disk but have
    /// no live handle are reachable through recovery, not here.
    pub fn open_temporary(&self, id: RecoveryId) -> Option<RecoverableTemporary> {
        handle::lookup_temporary(&self.shared, id)
    }

    /// Creates a new anonymous temporary for content staging.
    pub fn new_detached_temporary(&self) -> JournalResult<DetachedTemporary> {
        let temp = self.shared.with_store(|store| Ok(store.new_temporary()?))?;
        Ok(DetachedTemporary::new(Arc::downgrade(&self.shared), temp))
    }

    /// Turns a recovered temporary into a live handle under a new id.
    ///
    /// The blob temporary is re-tagged durably; the old id is released.
    pub fn keep_recovered(
        &self,
        recovered: RecoveredTemporary,
        new_id: RecoveryId,
    ) -> JournalResult<RecoverableTemporary> {
        if matches!(new_id.rtype, RecoveryType::Staging | RecoveryType::Journal) {
            return Err(JournalError::invalid_operation(format!(
                "recovery type {} is reserved for the journal",
                new_id.rtype
            )));
        }
        if handle::lookup_temporary(&self.shared, new_id).is_some() {
            return Err(JournalError::invalid_operation(format!(
                "temporary {new_id} is already open"
            )));
        }
        let (temp, xattr) = recovered.claim()?;
        self.shared
            .with_store(|store| Ok(store.tag_temporary(temp, new_id, Some(&xattr))?))?;
        handle::adopt_temporary(&self.shared, new_id, xattr, temp)
    }

    /// Whether an earlier commit failure has wedged this journal.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.shared.state.lock().poisoned
    }

    /// Tears the journal down without any cleanup and returns the
    /// underlying store, exactly as a crash would leave it.
    ///
    /// Outstanding handles become inert ([`JournalError::Detached`]).
    /// Primarily for crash-recovery testing; a real restart achieves
    /// the same by reopening the store.
    pub fn into_store(self) -> JournalResult<Box<dyn BlobStore>> {
        self.shared.store.lock().take().ok_or(JournalError::Detached)
    }

    /// Runs the commit pipeline for a transaction's locked handles.
    ///
    /// Pipeline: stage & build records, back-fill the `tx_size` chain,
    /// publish in memory, append + sync the journal (the durability
    /// barrier), then apply, sync again, and punch out the consumed
    /// journal region.
    pub(crate) fn commit_lockeds(
        &self,
        objects: &[Arc<LockedObjectInner>],
        temporaries: &[Arc<LockedTemporaryInner>],
    ) -> JournalResult<()> {
        let shared = &self.shared;
        let _queue = shared.queue.lock();

        if shared.state.lock().poisoned {
            return Err(JournalError::Poisoned);
        }

        // Stage new content and build the records. Failures here are
        // clean: nothing has been promised or published yet.
        let mut entries = Vec::with_capacity(objects.len() + temporaries.len());
        for locked in objects {
            if let Some(entry) = locked.build_entry(shared)? {
                entries.push(entry);
            }
        }
        for locked in temporaries {
            if let Some(entry) = locked.build_entry(shared)? {
                entries.push(entry);
            }
        }
        if entries.is_empty() {
            return Ok(());
        }

        // Back-fill the chain: entry k of n carries tx_size n-k, so
        // the last record of the transaction carries 1.
        let n = entries.len() as u32;
        for (k, entry) in entries.iter_mut().enumerate() {
            entry.tx_size = n - k as u32;
        }

        // Publish the new state in memory and collect the deferred
        // effects. Readers observe the transaction from here on.
        let mut applies: Vec<ApplyOp> = Vec::with_capacity(entries.len());
        for locked in objects {
            if let Some(op) = locked.publish() {
                applies.push(op);
            }
        }
        for locked in temporaries {
            if let Some(op) = locked.publish() {
                applies.push(op);
            }
        }

        // Append and sync the journal. Once the sync returns, the
        // transaction is durable; a failure leaves memory ahead of
        // disk, which only recovery can reconcile.
        let journal_temp = {
            let state = shared.state.lock();
            match state.journal_temp {
                Some(t) => t,
                None => {
                    return Err(JournalError::invalid_operation(
                        "journal not initialized; finish recovery first",
                    ))
                }
            }
        };
        let old_position = shared.state.lock().position;
        let bytes = encode_entries(&entries);
        let new_position = old_position + bytes.len() as u64;

        let written = shared.with_store(|store| {
            store.write_temporary(journal_temp, old_position, &bytes)?;
            store.sync_temporary(journal_temp)?;
            Ok(())
        });
        if let Err(e) = written {
            shared.state.lock().poisoned = true;
            error!(error = %e, "journal write failed after acceptance; journal poisoned");
            return Err(JournalError::commit_lost(e.to_string()));
        }
        shared.state.lock().position = new_position;
        debug!(
            records = n,
            old_position, new_position, "transaction journaled"
        );

        // Apply phase. The transaction is already durable, so any
        // failure past this point is reconciled by recovery, not by us.
        if let Err(e) = self.apply(applies, journal_temp, old_position, new_position) {
            shared.state.lock().poisoned = true;
            error!(error = %e, "apply failed after durable commit; journal poisoned");
            return Err(JournalError::commit_pending_recovery(e.to_string()));
        }
        Ok(())
    }

    fn apply(
        &self,
        applies: Vec<ApplyOp>,
        journal_temp: TempId,
        old_position: u64,
        new_position: u64,
    ) -> JournalResult<()> {
        self.shared.with_store(|store| {
            for op in applies {
                op.run(store)?;
            }

            // All effects of the transaction must hit disk before the
            // journal region describing them can be reclaimed.
            // TODO: batch this post-apply sync across commits on a
            // coarse cadence instead of paying it per transaction.
            store.sync_all()?;

            if self.shared.config.punch_holes {
                // Round down to block boundaries; holes can only be
                // punched whole blocks, and stale record fragments are
                // harmless because replay is idempotent.
                let mask = !(self.shared.config.block_size - 1);
                let start = old_position & mask;
                let end = new_position & mask;
                if end > start {
                    store.zero_temporary(journal_temp, start, end - start)?;
                }
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Journal")
            .field("position", &state.position)
            .field("staging_counter", &state.staging_counter)
            .field("poisoned", &state.poisoned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_blob::MemoryStore;

    fn fresh_journal() -> Journal {
        Journal::open(Box::new(MemoryStore::new()), JournalConfig::default()).unwrap()
    }

    fn seed(journal: &Journal, id: u64, data: &[u8]) -> Object {
        let mut txn = journal.begin();
        let content = journal.new_detached_temporary().unwrap();
        content.write_at(0, data).unwrap();
        let (object, _locked) = txn
            .create_object(ObjectId::new(id), Xattr::zeroed(), content)
            .unwrap();
        txn.commit(None).unwrap();
        object
    }

    #[test]
    fn open_missing_object_is_none() {
        let journal = fresh_journal();
        assert!(journal.open_object(ObjectId::new(404)).unwrap().is_none());
    }

    #[test]
    fn reopen_returns_the_same_handle() {
        let journal = fresh_journal();
        let object = seed(&journal, 1, b"x");

        let again = journal.open_object(ObjectId::new(1)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&object.shared, &again.shared));
    }

    #[test]
    fn handle_is_reconstructed_after_all_references_drop() {
        let journal = fresh_journal();
        let object = seed(&journal, 1, b"persisted");
        drop(object);

        let reopened = journal.open_object(ObjectId::new(1)).unwrap().unwrap();
        assert_eq!(reopened.read_at(0, 9).unwrap(), b"persisted");
        assert_eq!(reopened.generation(), 0); // fresh handle, fresh counter
    }

    #[test]
    fn into_store_detaches_live_handles() {
        let journal = fresh_journal();
        let object = seed(&journal, 1, b"x");

        let _store = journal.into_store().unwrap();
        assert!(matches!(object.read_at(0, 1), Err(JournalError::Detached)));
    }

    #[test]
    fn apply_failure_poisons_the_journal() {
        use tarn_testkit::{FaultPoint, FlakyStore};

        let (store, plan) = FlakyStore::new(Box::new(MemoryStore::new()));
        let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();

        plan.arm(FaultPoint::PlaceObject);
        let mut txn = journal.begin();
        let content = journal.new_detached_temporary().unwrap();
        content.write_at(0, b"doomed").unwrap();
        let (_object, _locked) = txn
            .create_object(ObjectId::new(1), Xattr::zeroed(), content)
            .unwrap();
        let result = txn.commit(None);
        assert!(matches!(
            result,
            Err(JournalError::CommitPendingRecovery { .. })
        ));
        assert!(journal.is_poisoned());

        // Everything after the failure is refused.
        let mut txn = journal.begin();
        let object2 = journal.new_detached_temporary().unwrap();
        object2.write_at(0, b"y").unwrap();
        let (_o, _l) = txn
            .create_object(ObjectId::new(2), Xattr::zeroed(), object2)
            .unwrap();
        assert!(matches!(txn.commit(None), Err(JournalError::Poisoned)));
    }

    #[test]
    fn journal_write_failure_is_commit_lost() {
        use tarn_testkit::{FaultPoint, FlakyStore};

        let (store, plan) = FlakyStore::new(Box::new(MemoryStore::new()));
        let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();
        let object = seed(&journal, 1, b"x");

        plan.arm(FaultPoint::SyncTemporary);
        let mut txn = journal.begin();
        let locked = txn.wrap(&object).unwrap();
        locked.set_xattr(Xattr::new([9; 64])).unwrap();
        let result = txn.commit(None);
        assert!(matches!(result, Err(JournalError::CommitLost { .. })));
        assert!(journal.is_poisoned());
    }
}
