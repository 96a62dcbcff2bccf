//! End-to-end crash and recovery scenarios.
//!
//! A "crash" here is [`Journal::into_store`]: the layer is torn down
//! with no cleanup and the store is handed to a fresh recovery pass,
//! exactly as a process restart would find it. Scripted faults from
//! the testkit cut the commit pipeline at chosen points first.

use tarn_blob::{BlobStore, DirStore, MemoryStore};
use tarn_journal::{
    EntryKind, EntryTarget, Journal, JournalConfig, JournalEntry, JournalError, ObjectId,
    Recovery, RecoveryId, RecoveryType, ENTRY_SIZE,
};
use tarn_testkit::fixtures::{content, temp_xattr, xattr};
use tarn_testkit::{FaultPoint, FlakyStore};

/// Reads the raw journal file out of a torn-down store.
fn journal_file_bytes(store: &mut Box<dyn BlobStore>) -> Vec<u8> {
    let journals = store.recover_temporaries(RecoveryType::Journal).unwrap();
    assert_eq!(journals.len(), 1, "exactly one journal file must exist");
    let size = store.temporary_size(journals[0].temp).unwrap();
    store
        .read_temporary(journals[0].temp, 0, size as usize)
        .unwrap()
}

fn decode_all(bytes: &[u8]) -> Vec<JournalEntry> {
    bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|chunk| JournalEntry::decode(chunk).expect("valid record"))
        .collect()
}

#[test]
fn create_crash_before_apply_recovers_object() {
    let (store, plan) = FlakyStore::new(Box::new(MemoryStore::new()));
    let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();

    plan.arm(FaultPoint::PlaceObject);
    let mut txn = journal.begin();
    let (_object, _locked) = txn
        .create_object(
            ObjectId::new(0x01),
            xattr(0x41),
            content(&journal, b"hello").unwrap(),
        )
        .unwrap();
    let result = txn.commit(None);
    assert!(matches!(
        result,
        Err(JournalError::CommitPendingRecovery { .. })
    ));

    // The transaction is durable; recovery must complete it.
    plan.disarm_all();
    let store = journal.into_store().unwrap();
    let journal = Journal::open(store, JournalConfig::default()).unwrap();

    let object = journal.open_object(ObjectId::new(0x01)).unwrap().unwrap();
    assert_eq!(object.xattr(), xattr(0x41));
    assert_eq!(object.read_at(0, 5).unwrap(), b"hello");
}

#[test]
fn first_commit_stages_under_id_zero() {
    let journal = Journal::open(Box::new(MemoryStore::new()), JournalConfig::default()).unwrap();

    let mut txn = journal.begin();
    let (_object, _locked) = txn
        .create_object(
            ObjectId::new(0x01),
            xattr(0x41),
            content(&journal, b"hello").unwrap(),
        )
        .unwrap();
    txn.commit(None).unwrap();

    let mut store = journal.into_store().unwrap();
    let entries = decode_all(&journal_file_bytes(&mut store));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::CreateObject);
    assert_eq!(entries[0].tx_size, 1);
    assert_eq!(entries[0].staging_id, 0);
}

#[test]
fn overwrite_crash_before_apply_recovers_new_state() {
    let (store, plan) = FlakyStore::new(Box::new(MemoryStore::new()));
    let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();

    let object = {
        let mut txn = journal.begin();
        let (object, _locked) = txn
            .create_object(
                ObjectId::new(0x02),
                xattr(0xA0),
                content(&journal, b"v1").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        object
    };

    plan.arm(FaultPoint::PlaceObject);
    let mut txn = journal.begin();
    let locked = txn.wrap(&object).unwrap();
    locked
        .overwrite(xattr(0xB0), content(&journal, b"v2-new").unwrap())
        .unwrap();
    assert!(txn.commit(None).is_err());
    drop(locked);
    drop(object);

    plan.disarm_all();
    let store = journal.into_store().unwrap();
    let journal = Journal::open(store, JournalConfig::default()).unwrap();

    let object = journal.open_object(ObjectId::new(0x02)).unwrap().unwrap();
    assert_eq!(object.xattr(), xattr(0xB0));
    assert_eq!(object.read_at(0, 6).unwrap(), b"v2-new");
}

#[test]
fn delete_crash_before_apply_recovers_removal() {
    let (store, plan) = FlakyStore::new(Box::new(MemoryStore::new()));
    let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();

    let object = {
        let mut txn = journal.begin();
        let (object, _locked) = txn
            .create_object(
                ObjectId::new(0x03),
                xattr(0x01),
                content(&journal, b"doomed").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        object
    };

    plan.arm(FaultPoint::RemoveObject);
    let mut txn = journal.begin();
    let locked = txn.wrap(&object).unwrap();
    locked.remove().unwrap();
    assert!(txn.commit(None).is_err());
    drop(locked);
    drop(object);

    plan.disarm_all();
    let store = journal.into_store().unwrap();
    let journal = Journal::open(store, JournalConfig::default()).unwrap();
    assert!(journal.open_object(ObjectId::new(0x03)).unwrap().is_none());
}

#[test]
fn consume_temp_journals_update_then_delete() {
    let journal = Journal::open(Box::new(MemoryStore::new()), JournalConfig::default()).unwrap();

    let temporary = {
        let mut txn = journal.begin();
        let (temporary, _locked) = txn
            .create_recoverable_temporary(
                RecoveryId::new(RecoveryType::User, 7),
                temp_xattr(0x70),
                content(&journal, b"temp payload").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        temporary
    };
    let object = {
        let mut txn = journal.begin();
        let (object, _locked) = txn
            .create_object(
                ObjectId::new(0x04),
                xattr(0x01),
                content(&journal, b"x").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        object
    };

    let mut txn = journal.begin();
    let locked = txn.wrap(&object).unwrap();
    locked.set_xattr(xattr(0x02)).unwrap();
    txn.commit(Some(temporary)).unwrap();

    assert_eq!(object.xattr(), xattr(0x02));
    drop(object);

    let mut store = journal.into_store().unwrap();
    let entries = decode_all(&journal_file_bytes(&mut store));
    assert_eq!(entries.len(), 4);

    // The final transaction: object records first, then temporaries,
    // chained 2, 1.
    assert_eq!(entries[2].kind, EntryKind::UpdateXattr);
    assert_eq!(entries[2].tx_size, 2);
    assert_eq!(entries[3].kind, EntryKind::DeleteTemporary);
    assert_eq!(entries[3].tx_size, 1);
    match entries[3].target {
        EntryTarget::Temporary { id, .. } => {
            assert_eq!(id, RecoveryId::new(RecoveryType::User, 7));
        }
        EntryTarget::Object { .. } => panic!("expected a temporary target"),
    }

    // Post-apply the temporary is gone for good.
    assert!(store
        .recover_temporaries(RecoveryType::User)
        .unwrap()
        .is_empty());
}

#[test]
fn records_chain_descending_within_a_transaction() {
    let journal = Journal::open(Box::new(MemoryStore::new()), JournalConfig::default()).unwrap();

    let (first, second) = {
        let mut txn = journal.begin();
        let (first, _l1) = txn
            .create_object(
                ObjectId::new(1),
                xattr(0x01),
                content(&journal, b"a").unwrap(),
            )
            .unwrap();
        let (second, _l2) = txn
            .create_object(
                ObjectId::new(2),
                xattr(0x02),
                content(&journal, b"b").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        (first, second)
    };

    let mut txn = journal.begin();
    let locked_first = txn.wrap(&first).unwrap();
    let locked_second = txn.wrap(&second).unwrap();
    let (_temp, _locked_temp) = txn
        .create_recoverable_temporary(
            RecoveryId::new(RecoveryType::Scratch, 1),
            temp_xattr(0x03),
            content(&journal, b"c").unwrap(),
        )
        .unwrap();
    locked_first.set_xattr(xattr(0x11)).unwrap();
    locked_second.set_xattr(xattr(0x22)).unwrap();
    txn.commit(None).unwrap();
    drop((locked_first, locked_second, first, second));

    let mut store = journal.into_store().unwrap();
    let entries = decode_all(&journal_file_bytes(&mut store));
    // Two single-record creates, then the three-record transaction.
    assert_eq!(entries.len(), 5);
    let chain: Vec<u32> = entries[2..].iter().map(|e| e.tx_size).collect();
    assert_eq!(chain, vec![3, 2, 1]);
    assert_eq!(entries[2].kind, EntryKind::UpdateXattr);
    assert_eq!(entries[3].kind, EntryKind::UpdateXattr);
    assert_eq!(entries[4].kind, EntryKind::CreateTemporary);
}

#[test]
fn hole_punched_journal_recovers_cleanly() {
    let (store, plan) = FlakyStore::new(Box::new(MemoryStore::new()));
    let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();

    let object = {
        let mut txn = journal.begin();
        let (object, _locked) = txn
            .create_object(
                ObjectId::new(0x10),
                xattr(0x00),
                content(&journal, b"seed").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        object
    };

    for i in 1..=100u8 {
        let mut txn = journal.begin();
        let locked = txn.wrap(&object).unwrap();
        locked.set_xattr(xattr(i)).unwrap();
        txn.commit(None).unwrap();
    }

    // One more update whose apply never runs.
    plan.arm(FaultPoint::SetObjectXattr);
    let mut txn = journal.begin();
    let locked = txn.wrap(&object).unwrap();
    locked.set_xattr(xattr(0xFF)).unwrap();
    assert!(txn.commit(None).is_err());
    drop(locked);
    drop(object);

    plan.disarm_all();
    let mut store = journal.into_store().unwrap();

    // 102 records were appended; every fully consumed block has been
    // punched to zeros.
    let bytes = journal_file_bytes(&mut store);
    assert_eq!(bytes.len(), 102 * ENTRY_SIZE);
    let punched = (101 * ENTRY_SIZE) & !4095;
    assert!(bytes[..punched].iter().all(|&b| b == 0));
    assert!(bytes[punched..].iter().any(|&b| b != 0));

    // Recovery skips the punched prefix, replays the stale applied
    // records idempotently, and completes the torn-off update.
    let journal = Journal::open(store, JournalConfig::default()).unwrap();
    let object = journal.open_object(ObjectId::new(0x10)).unwrap().unwrap();
    assert_eq!(object.xattr(), xattr(0xFF));
    assert_eq!(object.read_at(0, 4).unwrap(), b"seed");
}

#[test]
fn recovered_temporary_can_be_claimed_under_a_new_id() {
    let journal = Journal::open(Box::new(MemoryStore::new()), JournalConfig::default()).unwrap();
    {
        let mut txn = journal.begin();
        let (_temporary, _locked) = txn
            .create_recoverable_temporary(
                RecoveryId::new(RecoveryType::User, 3),
                temp_xattr(0x33),
                content(&journal, b"survivor").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
    }

    let store = journal.into_store().unwrap();
    let mut recovery = Recovery::new(store, JournalConfig::default()).unwrap();
    let mut recovered = recovery.recover_temporaries(RecoveryType::User);
    assert_eq!(recovered.len(), 1);
    let recovered = recovered.remove(0);
    assert_eq!(recovered.old_id(), RecoveryId::new(RecoveryType::User, 3));
    assert_eq!(recovered.xattr(), temp_xattr(0x33));
    assert_eq!(recovered.read_at(0, 8).unwrap(), b"survivor");

    let journal = recovery.finish().unwrap();
    let temporary = journal
        .keep_recovered(recovered, RecoveryId::new(RecoveryType::User, 9))
        .unwrap();
    assert_eq!(temporary.id(), RecoveryId::new(RecoveryType::User, 9));
    assert_eq!(temporary.read_at(0, 8).unwrap(), b"survivor");
    assert_eq!(temporary.xattr(), temp_xattr(0x33));
}

#[test]
fn staging_failure_aborts_the_commit_cleanly() {
    let (store, plan) = FlakyStore::new(Box::new(MemoryStore::new()));
    let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();

    plan.arm(FaultPoint::TagTemporary);
    let mut txn = journal.begin();
    let staged = content(&journal, b"half-born").unwrap();
    // Staging happens inside commit; creation itself succeeds.
    let (_temporary, _locked) = txn
        .create_recoverable_temporary(
            RecoveryId::new(RecoveryType::User, 5),
            temp_xattr(0x55),
            staged,
        )
        .unwrap();
    assert!(matches!(txn.commit(None), Err(JournalError::Blob(_))));

    // Nothing was promised and nothing was published: the journal
    // stays healthy.
    assert!(!journal.is_poisoned());

    plan.disarm_all();
    let store = journal.into_store().unwrap();
    let mut recovery = Recovery::new(store, JournalConfig::default()).unwrap();
    assert!(recovery.recover_temporaries(RecoveryType::User).is_empty());
    recovery.finish().unwrap();
}

#[test]
fn full_lifecycle_on_disk() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = DirStore::open(dir.path()).unwrap();
        let journal = Journal::open(Box::new(store), JournalConfig::default()).unwrap();

        let mut txn = journal.begin();
        let (_object, _locked) = txn
            .create_object(
                ObjectId::new(0xBEEF),
                xattr(0x01),
                content(&journal, b"on disk").unwrap(),
            )
            .unwrap();
        let (_temporary, _locked_temp) = txn
            .create_recoverable_temporary(
                RecoveryId::new(RecoveryType::User, 1),
                temp_xattr(0x02),
                content(&journal, b"temp on disk").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
    }

    {
        let store = DirStore::open(dir.path()).unwrap();
        let mut recovery = Recovery::new(Box::new(store), JournalConfig::default()).unwrap();

        let recovered = recovery.recover_temporaries(RecoveryType::User);
        assert_eq!(recovered.len(), 1);

        let journal = recovery.finish().unwrap();
        let object = journal.open_object(ObjectId::new(0xBEEF)).unwrap().unwrap();
        assert_eq!(object.xattr(), xattr(0x01));
        assert_eq!(object.read_at(0, 7).unwrap(), b"on disk");

        for rec in recovered {
            let temporary = journal
                .keep_recovered(rec, RecoveryId::new(RecoveryType::User, 1))
                .unwrap();
            assert_eq!(temporary.read_at(0, 12).unwrap(), b"temp on disk");
        }
    }
}
