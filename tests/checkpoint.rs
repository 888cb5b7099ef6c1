//! Checkpoint pipeline tests: dedup, cursor visibility, reclamation.

mod common;

use std::sync::Arc;

use ebbstore::bucket::{Bucket, EpBucket};
use ebbstore::checkpoint::PERSISTENCE_CURSOR;
use ebbstore::config::{EbbstoreConfig, CheckpointConfigSpec};
use ebbstore::executor::RuntimeContext;
use ebbstore::item::{DocKey, DurabilityLevel};
use ebbstore::kvstore::MemoryKvStore;
use ebbstore::topology::ReplicationTopology;
use ebbstore::vbucket::{VBucketStateKind, WriteOptions};

const VBID: u16 = 0;

fn make_bucket_with(config_spec: EbbstoreConfig) -> Arc<EpBucket> {
    let ctx = RuntimeContext::new(config_spec.build());
    EpBucket::new(ctx, Arc::new(MemoryKvStore::new()))
}

fn make_bucket() -> Arc<EpBucket> {
    make_bucket_with(EbbstoreConfig::default())
}

fn set_active(bucket: &EpBucket, nodes: &[&str]) {
    bucket
        .set_vbucket_state(
            VBID,
            VBucketStateKind::Active,
            Some(ReplicationTopology::from_nodes(nodes).unwrap()),
        )
        .unwrap();
}

fn key(name: &str) -> DocKey {
    DocKey::new(name)
}

#[test]
fn test_open_checkpoint_dedup_and_prepare_separation() {
    // Scenario G.
    let bucket = make_bucket();
    set_active(&bucket, &["active", "replica"]);
    let vb = bucket.get_vbucket(VBID).unwrap();
    let cm = vb.checkpoint_manager();

    let s1 = bucket
        .set(VBID, &key("a"), b"1".to_vec(), WriteOptions::default(), None)
        .unwrap();
    let s2 = bucket
        .set(VBID, &key("a"), b"2".to_vec(), WriteOptions::default(), None)
        .unwrap();
    let s3 = bucket
        .set(VBID, &key("b"), b"1".to_vec(), WriteOptions::default(), None)
        .unwrap();
    assert_eq!((s1.seqno, s2.seqno, s3.seqno), (1, 2, 3));

    assert_eq!(cm.num_checkpoints(), 1);
    let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 100).unwrap();
    let live: Vec<_> = batch
        .items
        .iter()
        .filter(|i| !i.is_meta())
        .map(|i| (String::from_utf8_lossy(i.key.bytes()).to_string(), i.by_seqno))
        .collect();
    // Dedup kept the seqno-2 version of "a".
    assert_eq!(live, vec![("a".to_string(), 2), ("b".to_string(), 3)]);

    // A durable write for "a" cannot share a checkpoint with the committed
    // "a" mutation.
    assert!(bucket
        .set(
            VBID,
            &key("a"),
            b"3".to_vec(),
            WriteOptions::durable(DurabilityLevel::Majority),
            None,
        )
        .is_err());
    assert_eq!(cm.num_checkpoints(), 2);
}

#[test]
fn test_cursor_prefix_visibility() {
    // Property 3: two cursors see the same prefix up to the slower one.
    let bucket = make_bucket();
    set_active(&bucket, &["active"]);
    let vb = bucket.get_vbucket(VBID).unwrap();
    let cm = vb.checkpoint_manager();
    cm.register_cursor("stream").unwrap();

    for i in 0..8 {
        bucket
            .set(
                VBID,
                &key(&format!("k{i}")),
                b"v".to_vec(),
                WriteOptions::default(),
                None,
            )
            .unwrap();
    }

    let full = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 100).unwrap();
    let partial = cm.peek_items_for_cursor("stream", 100).unwrap();
    let full_seqnos: Vec<_> = full.items.iter().map(|i| i.by_seqno).collect();
    let partial_seqnos: Vec<_> = partial.items.iter().map(|i| i.by_seqno).collect();
    assert_eq!(full_seqnos, partial_seqnos);
}

#[test]
fn test_flusher_advance_detaches_checkpoints_eagerly() {
    let bucket = make_bucket();
    set_active(&bucket, &["active", "replica"]);
    let vb = bucket.get_vbucket(VBID).unwrap();
    let cm = vb.checkpoint_manager();

    bucket
        .set(VBID, &key("a"), b"1".to_vec(), WriteOptions::default(), None)
        .unwrap();
    let _ = bucket.set(
        VBID,
        &key("a"),
        b"2".to_vec(),
        WriteOptions::durable(DurabilityLevel::Majority),
        None,
    );
    assert_eq!(cm.num_checkpoints(), 2);

    // Flushing moves the persistence cursor into the open checkpoint; the
    // closed one is detached at once and its memory is pending destruction.
    bucket.flush_vbucket_to_empty(VBID).unwrap();
    assert_eq!(cm.num_checkpoints(), 1);
    assert!(bucket.destroyer().pending_memory() > 0);

    let freed = bucket.run_destroyer();
    assert!(freed > 0);
    assert_eq!(bucket.destroyer().pending_memory(), 0);
}

#[test]
fn test_lazy_removal_via_remover_task() {
    let bucket = make_bucket_with(EbbstoreConfig {
        checkpoint: Some(CheckpointConfigSpec {
            max_items: Some(2),
            memory_quota: Some(0),
            eager_removal: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    });
    set_active(&bucket, &["active"]);
    let vb = bucket.get_vbucket(VBID).unwrap();
    let cm = vb.checkpoint_manager();

    for i in 0..10 {
        bucket
            .set(
                VBID,
                &key(&format!("k{i}")),
                vec![0u8; 128],
                WriteOptions::default(),
                None,
            )
            .unwrap();
    }
    let before = cm.num_checkpoints();
    assert!(before > 1);

    bucket.flush_vbucket_to_empty(VBID).unwrap();
    // Lazy mode: the flusher leaves closed checkpoints in place.
    assert_eq!(cm.num_checkpoints(), before);

    let outcome = bucket.run_checkpoint_remover();
    assert!(outcome.removed_memory > 0);
    assert_eq!(cm.num_checkpoints(), 1);

    assert!(bucket.run_destroyer() > 0);
}

#[test]
fn test_expel_keeps_skeleton_for_slow_cursor() {
    let bucket = make_bucket_with(EbbstoreConfig {
        checkpoint: Some(CheckpointConfigSpec {
            max_items: Some(100),
            memory_quota: Some(0),
            eager_removal: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    });
    set_active(&bucket, &["active"]);
    let vb = bucket.get_vbucket(VBID).unwrap();
    let cm = vb.checkpoint_manager();
    cm.register_cursor("stream").unwrap();

    for i in 0..10 {
        bucket
            .set(
                VBID,
                &key(&format!("k{i}")),
                vec![0u8; 128],
                WriteOptions::default(),
                None,
            )
            .unwrap();
    }
    // Both cursors consume the whole (Memory, unsplittable) checkpoint.
    bucket.flush_vbucket_to_empty(VBID).unwrap();
    let consumed = cm.peek_items_for_cursor("stream", 100).unwrap();
    cm.advance_cursor("stream", consumed.end).unwrap();

    // Expelling only touches closed checkpoints: nothing to do yet.
    let mem_before = cm.memory_usage();
    assert_eq!(cm.expel_unreferenced_items().count, 0);

    // A durable write closes the checkpoint (the stream cursor still
    // references it, so it cannot be removed); its consumed items can now
    // be expelled while the snapshot skeleton survives.
    let _ = bucket.set(
        VBID,
        &key("k0"),
        b"v".to_vec(),
        WriteOptions::durable(DurabilityLevel::Majority),
        None,
    );
    let result = cm.expel_unreferenced_items();
    assert_eq!(result.count, 10);
    assert!(result.memory > 0);
    assert!(cm.memory_usage() < mem_before);
    assert_eq!(cm.num_checkpoints(), 2);

    // The stream cursor still works after expelling: only meta items and
    // the new prepare remain ahead of it.
    let rest = cm.peek_items_for_cursor("stream", 100).unwrap();
    assert!(rest.items.iter().all(|i| i.by_seqno > 10 || i.is_meta()));
}

#[test]
fn test_remover_drops_slow_cursor_as_last_resort() {
    let bucket = make_bucket_with(EbbstoreConfig {
        checkpoint: Some(CheckpointConfigSpec {
            max_items: Some(2),
            memory_quota: Some(0),
            eager_removal: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    });
    set_active(&bucket, &["active"]);
    let vb = bucket.get_vbucket(VBID).unwrap();
    let cm = vb.checkpoint_manager();
    cm.register_cursor("slow-stream").unwrap();

    for i in 0..10 {
        bucket
            .set(
                VBID,
                &key(&format!("k{i}")),
                vec![0u8; 256],
                WriteOptions::default(),
                None,
            )
            .unwrap();
    }
    bucket.flush_vbucket_to_empty(VBID).unwrap();

    let outcome = bucket.run_checkpoint_remover();
    assert_eq!(outcome.dropped_cursors, vec!["slow-stream".to_string()]);
    assert!(outcome.removed_memory > 0);
    assert!(cm.cursor_pos("slow-stream").is_none());
    // The persistence cursor is never dropped.
    assert!(cm.cursor_pos(PERSISTENCE_CURSOR).is_some());
}

#[test]
fn test_checkpoint_id_and_hcs_recorded_at_close() {
    let bucket = make_bucket();
    set_active(&bucket, &["active", "replica"]);
    let vb = bucket.get_vbucket(VBID).unwrap();
    let cm = vb.checkpoint_manager();

    let _ = bucket.set(
        VBID,
        &key("k"),
        b"v".to_vec(),
        WriteOptions::durable(DurabilityLevel::Majority),
        None,
    );
    bucket.seqno_acknowledged(VBID, "replica", 1).unwrap();
    // Commit opened a second checkpoint and closed the first with the
    // completed watermark stamped.
    assert_eq!(cm.num_checkpoints(), 2);
    let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 100).unwrap();
    assert_eq!(batch.high_completed_seqno, None); // last visited is open
    assert_eq!(vb.high_completed_seqno(), 1);
}
