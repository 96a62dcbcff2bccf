//! Commit pipeline shape and ordering.
//!
//! These tests watch the blob store operation log to assert what the
//! pipeline promises: journal records reach disk and are synced before
//! any apply work, apply effects run in lock insertion order, and
//! apply phases of concurrent commits never interleave.

use std::sync::Arc;
use tarn_blob::MemoryStore;
use tarn_journal::{Journal, JournalConfig, ObjectId, RecoveryId, RecoveryType};
use tarn_testkit::fixtures::{content, temp_xattr, xattr};
use tarn_testkit::{Recorder, RecordingStore};

fn recording_journal(config: JournalConfig) -> (Journal, Arc<Recorder>) {
    let (store, recorder) = RecordingStore::new(Box::new(MemoryStore::new()));
    let journal = Journal::open(Box::new(store), config).unwrap();
    recorder.clear(); // drop recovery noise
    (journal, recorder)
}

#[test]
fn journal_is_synced_before_any_apply_work() {
    let (journal, recorder) = recording_journal(JournalConfig::default());

    let mut txn = journal.begin();
    let (_object, _locked) = txn
        .create_object(
            ObjectId::new(1),
            xattr(0x01),
            content(&journal, b"payload").unwrap(),
        )
        .unwrap();
    txn.commit(None).unwrap();

    let ops = recorder.ops();
    let sync_idx = ops
        .iter()
        .position(|op| op.starts_with("sync_temporary"))
        .expect("journal sync must happen");
    let place_idx = ops
        .iter()
        .position(|op| op.starts_with("place_object"))
        .expect("apply must happen");
    let sync_all_idx = ops
        .iter()
        .position(|op| op == "sync_all")
        .expect("post-apply sync must happen");

    assert!(sync_idx < place_idx, "durability barrier precedes apply");
    assert!(place_idx < sync_all_idx, "apply precedes the second sync");
}

#[test]
fn apply_effects_run_in_lock_insertion_order() {
    let (journal, recorder) = recording_journal(JournalConfig::default());

    let (first, second) = {
        let mut txn = journal.begin();
        let (first, _l1) = txn
            .create_object(ObjectId::new(1), xattr(1), content(&journal, b"a").unwrap())
            .unwrap();
        let (second, _l2) = txn
            .create_object(ObjectId::new(2), xattr(2), content(&journal, b"b").unwrap())
            .unwrap();
        txn.commit(None).unwrap();
        (first, second)
    };
    recorder.clear();

    // Objects in wrap order, then the temporary.
    let mut txn = journal.begin();
    let locked_second = txn.wrap(&second).unwrap();
    let locked_first = txn.wrap(&first).unwrap();
    locked_second.set_xattr(xattr(0x22)).unwrap();
    locked_first.set_xattr(xattr(0x11)).unwrap();
    let (_temp, _locked_temp) = txn
        .create_recoverable_temporary(
            RecoveryId::new(RecoveryType::User, 1),
            temp_xattr(3),
            content(&journal, b"t").unwrap(),
        )
        .unwrap();
    txn.commit(None).unwrap();

    let ops = recorder.ops();
    let apply_ops: Vec<&String> = ops
        .iter()
        .filter(|op| op.starts_with("set_object_xattr") || op.starts_with("tag_temporary"))
        .collect();
    // The staging tag comes first (entry build), then the applies in
    // insertion order: object 2, object 1, adopt temporary.
    assert_eq!(apply_ops.len(), 4);
    assert!(apply_ops[0].starts_with("tag_temporary"), "staging tag");
    assert_eq!(apply_ops[1].as_str(), "set_object_xattr obj:2");
    assert_eq!(apply_ops[2].as_str(), "set_object_xattr obj:1");
    assert!(apply_ops[3].contains("as user:1"), "adoption tag");
}

#[test]
fn concurrent_commits_never_interleave() {
    let (journal, recorder) =
        recording_journal(JournalConfig::default().punch_holes(false));

    let objects: Vec<_> = (0..2u64)
        .map(|id| {
            let mut txn = journal.begin();
            let (object, _locked) = txn
                .create_object(
                    ObjectId::new(id),
                    xattr(id as u8),
                    content(&journal, b"seed").unwrap(),
                )
                .unwrap();
            txn.commit(None).unwrap();
            object
        })
        .collect();
    recorder.clear();

    const ROUNDS: u64 = 25;
    std::thread::scope(|scope| {
        for object in &objects {
            let journal = journal.clone();
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let mut txn = journal.begin();
                    let locked = txn.wrap(object).unwrap();
                    locked.set_xattr(xattr((round % 251) as u8)).unwrap();
                    txn.commit(None).unwrap();
                }
            });
        }
    });

    assert!(!journal.is_poisoned());
    for object in &objects {
        // 1 for creation plus one per update round.
        assert_eq!(object.generation(), 1 + ROUNDS);
    }

    // Every commit's pipeline is one contiguous op block:
    // journal append, journal sync, apply, global sync.
    let ops = recorder.ops();
    assert_eq!(ops.len(), (2 * ROUNDS) as usize * 4);
    for block in ops.chunks(4) {
        assert!(block[0].starts_with("write_temporary"), "append: {block:?}");
        assert!(block[1].starts_with("sync_temporary"), "barrier: {block:?}");
        assert!(block[2].starts_with("set_object_xattr"), "apply: {block:?}");
        assert_eq!(block[3], "sync_all", "second sync: {block:?}");
    }
}

#[test]
fn update_then_delete_applies_as_removal_and_drops_staged_content() {
    let (journal, recorder) = recording_journal(JournalConfig::default());

    let object = {
        let mut txn = journal.begin();
        let (object, _locked) = txn
            .create_object(
                ObjectId::new(0x02),
                xattr(0x0A),
                content(&journal, b"v1").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        object
    };
    recorder.clear();

    let mut txn = journal.begin();
    let locked = txn.wrap(&object).unwrap();
    locked
        .overwrite(xattr(0x0B), content(&journal, b"v2").unwrap())
        .unwrap();
    locked.remove().unwrap();
    txn.commit(None).unwrap();
    drop(locked);

    let ops = recorder.ops();
    // The final flags decide the effect: a removal, never a placement.
    assert!(ops.iter().any(|op| op.starts_with("remove_object")));
    assert!(!ops.iter().any(|op| op.starts_with("place_object")));
    // The staged-but-unused content is released once the lock drops.
    assert!(ops.iter().any(|op| op.starts_with("drop_temporary")));

    // Once the last handle is gone, the object is unreachable.
    drop(object);
    assert!(journal.open_object(ObjectId::new(0x02)).unwrap().is_none());
}

#[test]
fn no_op_transaction_touches_nothing() {
    let (journal, recorder) = recording_journal(JournalConfig::default());

    let object = {
        let mut txn = journal.begin();
        let (object, _locked) = txn
            .create_object(
                ObjectId::new(1),
                xattr(1),
                content(&journal, b"x").unwrap(),
            )
            .unwrap();
        txn.commit(None).unwrap();
        object
    };
    recorder.clear();

    let mut txn = journal.begin();
    let _locked = txn.wrap(&object).unwrap();
    txn.commit(None).unwrap();

    assert!(recorder.ops().is_empty(), "no journal write, no apply");
}
