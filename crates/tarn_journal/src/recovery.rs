//! Crash recovery: journal replay and temporary reclamation.
//!
//! Recovery reconstructs exactly the set of operations whose journal
//! records were fully persisted before the crash, then hands off to a
//! running [`Journal`].
//!
//! ## Replay Policy
//!
//! The journal is read as a fixed-stride array of records and walked
//! forward, validating the descending `tx_size` chain of each
//! transaction:
//!
//! - An all-zero record at a transaction boundary is punched padding
//!   (or the zeroed tail of the file) and is skipped.
//! - Any record that fails to decode, carries `tx_size == 0`, or
//!   breaks the descending chain is a torn write: replay halts and the
//!   remainder of the journal is discarded. A transaction cut off
//!   mid-chain was never acknowledged as durable.
//!
//! Replay is idempotent: every destructive step either consumes a
//! staging temporary or observes it already absent, so replaying the
//! same journal twice converges on the same state.

use crate::config::JournalConfig;
use crate::entry::{EntryKind, EntryTarget, JournalEntry, ENTRY_SIZE};
use crate::error::{JournalError, JournalResult};
use crate::handle::{self, Object};
use crate::journal::{Journal, JournalShared, JournalState, Registry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tarn_blob::{BlobStore, ObjectId, RecoveryId, RecoveryType, TempId, TemporaryXattr};
use tracing::debug;

/// A recoverable temporary rediscovered by recovery, not yet claimed.
///
/// Claim it with [`Journal::keep_recovered`] to turn it into a live
/// handle under a new id. Dropping it unclaimed deletes the backing
/// blob temporary (recovery is the last reference).
pub struct RecoveredTemporary {
    pub(crate) journal: Weak<JournalShared>,
    pub(crate) old_id: RecoveryId,
    pub(crate) xattr: TemporaryXattr,
    pub(crate) temp: Option<TempId>,
}

impl RecoveredTemporary {
    /// The id the temporary carried before the restart.
    #[must_use]
    pub fn old_id(&self) -> RecoveryId {
        self.old_id
    }

    /// The attribute record as of the last accepted transaction.
    #[must_use]
    pub fn xattr(&self) -> TemporaryXattr {
        self.xattr
    }

    /// Reads `len` bytes of the recovered content starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let temp = self
            .temp
            .ok_or_else(|| JournalError::invalid_operation("recovered temporary already claimed"))?;
        let shared = self.journal.upgrade().ok_or(JournalError::Detached)?;
        shared.with_store(|store| Ok(store.read_temporary(temp, offset, len)?))
    }

    /// Size of the recovered content in bytes.
    pub fn size(&self) -> JournalResult<u64> {
        let temp = self
            .temp
            .ok_or_else(|| JournalError::invalid_operation("recovered temporary already claimed"))?;
        let shared = self.journal.upgrade().ok_or(JournalError::Detached)?;
        shared.with_store(|store| Ok(store.temporary_size(temp)?))
    }

    /// Takes ownership of the backing blob temporary.
    pub(crate) fn claim(mut self) -> JournalResult<(TempId, TemporaryXattr)> {
        let temp = self
            .temp
            .take()
            .ok_or_else(|| JournalError::invalid_operation("recovered temporary already claimed"))?;
        Ok((temp, self.xattr))
    }
}

impl Drop for RecoveredTemporary {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            if let Some(shared) = self.journal.upgrade() {
                let _ = shared.with_store(|store| Ok(store.drop_temporary(temp)?));
            }
        }
    }
}

impl std::fmt::Debug for RecoveredTemporary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveredTemporary")
            .field("old_id", &self.old_id)
            .field("claimed", &self.temp.is_none())
            .finish()
    }
}

/// Reconstructs a [`Journal`] from whatever is durably in a blob store.
///
/// Construction enumerates leftover staging and typed temporaries and
/// replays the journal file, if one exists. Callers then claim the
/// recovered temporaries they want via
/// [`recover_temporaries`](Self::recover_temporaries) and call
/// [`finish`](Self::finish); everything unclaimed is garbage-collected.
pub struct Recovery {
    shared: Arc<JournalShared>,
    staging: HashMap<u64, TempId>,
    temporaries: BTreeMap<RecoveryId, RecoveredTemporary>,
    old_journal: Option<TempId>,
}

impl Recovery {
    /// Runs recovery over the given store.
    ///
    /// # Errors
    ///
    /// Fails on configuration errors, blob store errors, or if more
    /// than one journal file exists.
    pub fn new(store: Box<dyn BlobStore>, config: JournalConfig) -> JournalResult<Self> {
        config.validate()?;
        let shared = Arc::new(JournalShared {
            store: Mutex::new(Some(store)),
            state: Mutex::new(JournalState {
                journal_temp: None,
                position: 0,
                staging_counter: 0,
                poisoned: false,
            }),
            registry: Mutex::new(Registry::default()),
            queue: Mutex::new(()),
            config,
        });

        let mut recovery = Self {
            shared,
            staging: HashMap::new(),
            temporaries: BTreeMap::new(),
            old_journal: None,
        };
        recovery.enumerate()?;
        if let Some(journal_temp) = recovery.old_journal {
            recovery.replay(journal_temp)?;
        }
        Ok(recovery)
    }

    fn enumerate(&mut self) -> JournalResult<()> {
        let shared = Arc::clone(&self.shared);

        let staged =
            shared.with_store(|store| Ok(store.recover_temporaries(RecoveryType::Staging)?))?;
        for blob in staged {
            self.staging.insert(blob.old_id.index, blob.temp);
        }

        for rtype in RecoveryType::ALL {
            if matches!(rtype, RecoveryType::Staging | RecoveryType::Journal) {
                continue;
            }
            let found = shared.with_store(|store| Ok(store.recover_temporaries(rtype)?))?;
            for blob in found {
                self.temporaries.insert(
                    blob.old_id,
                    RecoveredTemporary {
                        journal: Arc::downgrade(&shared),
                        old_id: blob.old_id,
                        xattr: blob.xattr,
                        temp: Some(blob.temp),
                    },
                );
            }
        }

        let journals =
            shared.with_store(|store| Ok(store.recover_temporaries(RecoveryType::Journal)?))?;
        if journals.len() > 1 {
            return Err(JournalError::corrupted(format!(
                "{} journal files found; at most one may exist",
                journals.len()
            )));
        }
        self.old_journal = journals.first().map(|blob| blob.temp);
        Ok(())
    }

    fn replay(&mut self, journal_temp: TempId) -> JournalResult<()> {
        let shared = Arc::clone(&self.shared);
        let bytes = shared.with_store(|store| {
            let size = store.temporary_size(journal_temp)?;
            Ok(store.read_temporary(journal_temp, 0, size as usize)?)
        })?;

        let mut expected: u32 = 0;
        let mut window: Vec<JournalEntry> = Vec::new();
        let mut replayed = 0usize;
        for chunk in bytes.chunks_exact(ENTRY_SIZE) {
            if expected == 0 && chunk.iter().all(|&b| b == 0) {
                // Punched prefix or the zeroed tail of the file.
                continue;
            }
            let Some(entry) = JournalEntry::decode(chunk) else {
                break;
            };
            if entry.tx_size == 0 || (expected > 0 && entry.tx_size != expected) {
                // Torn write: the chain is broken, everything from
                // here on was never durable.
                break;
            }
            expected = entry.tx_size - 1;
            window.push(entry);
            if expected == 0 {
                replayed += window.len();
                for entry in window.drain(..) {
                    self.replay_entry(&entry)?;
                }
            }
        }
        // A partial window is a transaction that was cut off mid-append.
        debug!(
            records = replayed,
            discarded = window.len(),
            "journal replay complete"
        );
        Ok(())
    }

    fn replay_entry(&mut self, entry: &JournalEntry) -> JournalResult<()> {
        let shared = Arc::clone(&self.shared);
        match (entry.kind, entry.target) {
            // Create and update converge at recovery: the staged
            // content replaces the target id atomically either way.
            (
                EntryKind::CreateObject | EntryKind::UpdateObject,
                EntryTarget::Object { id, xattr },
            ) => {
                let Some(staged) = self.staging.remove(&entry.staging_id) else {
                    // The staged source is gone: this operation was
                    // already applied before the crash.
                    return Ok(());
                };
                shared.with_store(|store| Ok(store.place_object(id, &xattr, staged)?))
            }
            (EntryKind::UpdateXattr, EntryTarget::Object { id, xattr }) => {
                shared.with_store(|store| {
                    if store.open_object(id)?.is_some() {
                        store.set_object_xattr(id, &xattr)?;
                    }
                    Ok(())
                })
            }
            (EntryKind::DeleteObject, EntryTarget::Object { id, .. }) => {
                shared.with_store(|store| {
                    if store.open_object(id)?.is_some() {
                        store.remove_object(id)?;
                    }
                    Ok(())
                })
            }
            (EntryKind::CreateTemporary, EntryTarget::Temporary { id, xattr }) => {
                let Some(staged) = self.staging.remove(&entry.staging_id) else {
                    return Ok(());
                };
                if self.temporaries.contains_key(&id) {
                    // Already materialized; the duplicate source is dead.
                    shared.with_store(|store| Ok(store.drop_temporary(staged)?))
                } else {
                    self.temporaries.insert(
                        id,
                        RecoveredTemporary {
                            journal: Arc::downgrade(&shared),
                            old_id: id,
                            xattr,
                            temp: Some(staged),
                        },
                    );
                    Ok(())
                }
            }
            (EntryKind::UpdateTemporary, EntryTarget::Temporary { id, xattr }) => {
                let Some(staged) = self.staging.remove(&entry.staging_id) else {
                    return Ok(());
                };
                let dst = self.temporaries.get_mut(&id).and_then(|rec| rec.temp);
                match dst {
                    Some(dst) => {
                        shared
                            .with_store(|store| Ok(store.overwrite_temporary(dst, &xattr, staged)?))?;
                        if let Some(rec) = self.temporaries.get_mut(&id) {
                            rec.xattr = xattr;
                        }
                        Ok(())
                    }
                    None => shared.with_store(|store| Ok(store.drop_temporary(staged)?)),
                }
            }
            (EntryKind::UpdateTemporaryXattr, EntryTarget::Temporary { id, xattr }) => {
                if let Some(rec) = self.temporaries.get_mut(&id) {
                    rec.xattr = xattr;
                }
                Ok(())
            }
            (EntryKind::DeleteTemporary, EntryTarget::Temporary { id, .. }) => {
                // Dropping the wrapper deletes the blob temporary.
                self.temporaries.remove(&id);
                Ok(())
            }
            _ => Err(JournalError::corrupted(
                "journal record kind does not match its target",
            )),
        }
    }

    /// Opens a durable object during recovery.
    ///
    /// Handles opened here stay valid on the journal that
    /// [`finish`](Self::finish) returns.
    pub fn object(&self, id: ObjectId) -> JournalResult<Option<Object>> {
        handle::open_object(&self.shared, id)
    }

    /// Drains every recovered temporary of the given type, in id order.
    ///
    /// The reserved `Staging` and `Journal` types never yield anything.
    pub fn recover_temporaries(&mut self, rtype: RecoveryType) -> Vec<RecoveredTemporary> {
        let keys: Vec<RecoveryId> = self
            .temporaries
            .range(RecoveryId::new(rtype, 0)..=RecoveryId::new(rtype, u64::MAX))
            .map(|(id, _)| *id)
            .collect();
        keys.iter()
            .filter_map(|id| self.temporaries.remove(id))
            .collect()
    }

    /// Completes recovery and returns the running journal.
    ///
    /// Unconsumed staging temporaries and unclaimed recovered
    /// temporaries are deleted, the old journal file is replaced with
    /// a fresh empty one, and the write queue starts empty.
    pub fn finish(mut self) -> JournalResult<Journal> {
        let shared = Arc::clone(&self.shared);

        // Replay effects must be durable before the journal that
        // describes them can be destroyed.
        shared.with_store(|store| Ok(store.sync_all()?))?;

        let leftover: Vec<TempId> = self.staging.drain().map(|(_, temp)| temp).collect();
        shared.with_store(|store| {
            for temp in leftover {
                store.drop_temporary(temp)?;
            }
            Ok(())
        })?;
        // Unclaimed recovered temporaries are unreferenced; each drop
        // deletes its blob temporary.
        self.temporaries.clear();

        let old_journal = self.old_journal.take();
        let journal_temp = shared.with_store(|store| {
            if let Some(old) = old_journal {
                store.drop_temporary(old)?;
            }
            let temp = store.new_temporary()?;
            store.tag_temporary(temp, RecoveryId::new(RecoveryType::Journal, 0), None)?;
            store.sync_all()?;
            Ok(temp)
        })?;

        {
            let mut state = shared.state.lock();
            state.journal_temp = Some(journal_temp);
            state.position = 0;
            state.staging_counter = 0;
        }
        debug!("recovery finished; journal initialized");
        Ok(Journal { shared })
    }
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recovery")
            .field("staging", &self.staging.len())
            .field("temporaries", &self.temporaries.len())
            .field("has_journal", &self.old_journal.is_some())
            .finish()
    }
}
