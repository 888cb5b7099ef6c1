//! Compaction tests: prepares must never expire, completed prepares are
//! purged, expired documents are deleted through the normal path.

mod common;

use std::sync::Arc;

use ebbstore::bucket::{Bucket, EpBucket};
use ebbstore::executor::RuntimeContext;
use ebbstore::item::{CommittedState, DocKey, DurabilityLevel};
use ebbstore::kvstore::{
    CompactionCallbacks, CompactionConfig, DiskDoc, DiskDocKey, KVStore, MemoryKvStore,
};
use ebbstore::topology::ReplicationTopology;
use ebbstore::vbucket::{now_secs, VBucketStateKind, WriteOptions};

const VBID: u16 = 0;

fn key(name: &str) -> DocKey {
    DocKey::new(name)
}

fn make_bucket() -> (Arc<EpBucket>, Arc<MemoryKvStore>) {
    let store = Arc::new(MemoryKvStore::new());
    let bucket = EpBucket::new(RuntimeContext::default(), store.clone());
    bucket
        .set_vbucket_state(
            VBID,
            VBucketStateKind::Active,
            Some(ReplicationTopology::from_nodes(&["active", "replica"]).unwrap()),
        )
        .unwrap();
    (bucket, store)
}

#[test]
fn test_sync_delete_prepare_not_expired_by_compaction() {
    // Scenario D: a SyncDelete prepare carries its deletion time in the
    // expiry field. Compaction must discriminate on committed-state and
    // never treat it as an expired document.
    let (bucket, store) = make_bucket();

    // Committed document with an expiry in the future.
    let opts = WriteOptions {
        expiry: now_secs() + 5,
        ..Default::default()
    };
    bucket
        .set(VBID, &key("k"), b"v".to_vec(), opts, None)
        .unwrap();

    // SyncDelete: the prepare's expiry field is set to *now*.
    assert!(bucket
        .delete(
            VBID,
            &key("k"),
            WriteOptions::durable(DurabilityLevel::Majority),
            None,
        )
        .is_err());

    bucket.flush_vbucket_to_empty(VBID).unwrap();

    // Compact with wall clock moved past the prepare's deletion timestamp.
    // The expiry callback failing the test is the assertion.
    let mut expiry = |key: &DiskDocKey, doc: &DiskDoc| {
        panic!("nothing is eligible for expiry, got {key:?} at seqno {}", doc.by_seqno);
    };
    let mut drop_key = |_: &DiskDocKey, _: u64, _: bool| {};
    let result = store
        .compact(
            VBID,
            &CompactionConfig {
                now_secs: now_secs() + 1,
                drop_prepares_below: 0,
                purge_tombstones_before: 0,
            },
            &mut CompactionCallbacks {
                expiry: &mut expiry,
                drop_key: &mut drop_key,
            },
        )
        .unwrap();
    assert_eq!(result.expired, 0);
    assert_eq!(result.purged_prepares, 0);

    // The prepare is still on disk, pending and deleted.
    let prepare = store
        .get(VBID, &DiskDocKey::prepared(&key("k")))
        .unwrap()
        .expect("prepare survives compaction");
    assert_eq!(prepare.committed, CommittedState::Pending);
    assert!(prepare.deleted);

    // The committed document is untouched.
    let committed = store
        .get(VBID, &DiskDocKey::committed(&key("k")))
        .unwrap()
        .expect("committed doc survives compaction");
    assert_eq!(committed.value, b"v");
}

#[test]
fn test_completed_prepares_purged_below_watermark() {
    let (bucket, store) = make_bucket();

    // Full SyncWrite cycle, persisted.
    assert!(bucket
        .set(
            VBID,
            &key("k"),
            b"v".to_vec(),
            WriteOptions::durable(DurabilityLevel::Majority),
            None,
        )
        .is_err());
    bucket.seqno_acknowledged(VBID, "replica", 1).unwrap();
    bucket.flush_vbucket_to_empty(VBID).unwrap();

    // The completed prepare sits in the prepared space as a tombstone.
    assert!(store
        .get(VBID, &DiskDocKey::prepared(&key("k")))
        .unwrap()
        .is_some());

    let result = bucket.compact_vbucket(VBID).unwrap();
    assert_eq!(result.purged_prepares, 1);
    assert!(store
        .get(VBID, &DiskDocKey::prepared(&key("k")))
        .unwrap()
        .is_none());
    // The committed document is untouched by the purge.
    assert!(store
        .get(VBID, &DiskDocKey::committed(&key("k")))
        .unwrap()
        .is_some());

    // A second pass finds nothing.
    let again = bucket.compact_vbucket(VBID).unwrap();
    assert_eq!(again.purged_prepares, 0);
}

#[test]
fn test_aborted_prepare_purged_and_reported() {
    let (bucket, store) = make_bucket();

    assert!(bucket
        .set(
            VBID,
            &key("k"),
            b"v".to_vec(),
            WriteOptions::durable(DurabilityLevel::Majority),
            None,
        )
        .is_err());
    bucket.abort(VBID, &key("k"), 1).unwrap();
    bucket.flush_vbucket_to_empty(VBID).unwrap();

    let mut dropped: Vec<(u64, bool)> = Vec::new();
    let mut expiry = |_: &DiskDocKey, _: &DiskDoc| {};
    let mut drop_key =
        |_: &DiskDocKey, seqno: u64, is_abort: bool| dropped.push((seqno, is_abort));
    store
        .compact(
            VBID,
            &CompactionConfig {
                now_secs: now_secs(),
                drop_prepares_below: 1,
                purge_tombstones_before: 0,
            },
            &mut CompactionCallbacks {
                expiry: &mut expiry,
                drop_key: &mut drop_key,
            },
        )
        .unwrap();
    assert_eq!(dropped, vec![(1, true)]);
    assert!(store
        .get(VBID, &DiskDocKey::prepared(&key("k")))
        .unwrap()
        .is_none());
}

#[test]
fn test_expired_document_deleted_via_compaction() {
    let (bucket, store) = make_bucket();
    let vb = bucket.get_vbucket(VBID).unwrap();

    let opts = WriteOptions {
        expiry: 1, // long past
        ..Default::default()
    };
    bucket
        .set(VBID, &key("k"), b"v".to_vec(), opts, None)
        .unwrap();
    bucket.flush_vbucket_to_empty(VBID).unwrap();
    assert_eq!(vb.num_items(), 1);

    let result = bucket.compact_vbucket(VBID).unwrap();
    assert_eq!(result.expired, 1);
    // The expiry fed back through the deletion path.
    assert_eq!(vb.num_items(), 0);

    bucket.flush_vbucket_to_empty(VBID).unwrap();
    let doc = store
        .get(VBID, &DiskDocKey::committed(&key("k")))
        .unwrap()
        .expect("tombstone on disk");
    assert!(doc.deleted);
}
