//! The flusher: drains persistence cursors into the KVStore.
//!
//! One flusher serves all vBuckets of a shard, visiting them serially. A
//! flush collects a batch from the persistence cursor (without advancing
//! it), applies persist-time deduplication per disk key, commits the batch
//! atomically together with the vbucket_state document, and only then
//! advances the cursor and notifies the durability monitor. A failed commit
//! leaves the cursor untouched; the identical batch is retried on the next
//! wakeup with exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::checkpoint::{CheckpointDestroyer, PERSISTENCE_CURSOR};
use crate::item::{QueueOp, Seqno};
use crate::kvstore::{DiskDoc, DiskDocKey, FlushBatch, FlushOp, KVStore, KVStoreError};
use crate::stats::EngineStats;
use crate::vbucket::{now_secs, VBucket};

/// Outcome of flushing one vBucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// More items remain behind the persistence cursor.
    pub more_available: bool,
    /// Non-meta items drained from the checkpoint manager.
    pub num_flushed: usize,
    /// A checkpoint became unreferenced; the remover should run (lazy
    /// removal mode only).
    pub wake_checkpoint_remover: bool,
}

impl FlushResult {
    const NOOP: FlushResult = FlushResult {
        more_available: false,
        num_flushed: 0,
        wake_checkpoint_remover: false,
    };
}

/// Drains queued mutations to durable storage.
pub struct Flusher {
    kvstore: Arc<dyn KVStore>,
    destroyer: Arc<CheckpointDestroyer>,
    stats: Arc<EngineStats>,
    batch_split_trigger: usize,
}

impl Flusher {
    /// Flusher writing through `kvstore`, handing detached checkpoints to
    /// `destroyer`.
    pub fn new(
        kvstore: Arc<dyn KVStore>,
        destroyer: Arc<CheckpointDestroyer>,
        stats: Arc<EngineStats>,
        batch_split_trigger: usize,
    ) -> Self {
        Self {
            kvstore,
            destroyer,
            stats,
            batch_split_trigger,
        }
    }

    /// Flush everything currently pending for one vBucket.
    pub fn flush_vbucket(&self, vb: &VBucket) -> Result<FlushResult, KVStoreError> {
        let cm = vb.checkpoint_manager();
        let collected = cm
            .peek_items_for_cursor(PERSISTENCE_CURSOR, self.batch_split_trigger)
            .map_err(|e| KVStoreError::Corrupt(format!("persistence cursor lost: {e}")))?;
        if collected.items.is_empty() {
            return Ok(FlushResult::NOOP);
        }

        // Persist-time dedup: within the batch one write survives per disk
        // key. A later op replaces the earlier one in place, keeping batch
        // order stable.
        let mut ops: Vec<FlushOp> = Vec::with_capacity(collected.items.len());
        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut push_op = |ops: &mut Vec<FlushOp>, op: FlushOp| {
            let encoded = op.key().encoded();
            match index.get(&encoded) {
                Some(&at) => ops[at] = op,
                None => {
                    index.insert(encoded, ops.len());
                    ops.push(op);
                }
            }
        };

        let mut num_flushed = 0usize;
        let mut high_seqno: Seqno = 0;
        for item in &collected.items {
            high_seqno = high_seqno.max(item.by_seqno);
            if item.is_meta() {
                continue;
            }
            num_flushed += 1;
            match item.op {
                QueueOp::Mutation | QueueOp::Deletion | QueueOp::Expiration => {
                    push_op(
                        &mut ops,
                        FlushOp::Put {
                            key: DiskDocKey::committed(&item.key),
                            doc: DiskDoc::from_item(item),
                        },
                    );
                }
                QueueOp::PendingSyncWrite => {
                    push_op(
                        &mut ops,
                        FlushOp::Put {
                            key: DiskDocKey::prepared(&item.key),
                            doc: DiskDoc::from_item(item),
                        },
                    );
                }
                QueueOp::CommitSyncWrite => {
                    push_op(
                        &mut ops,
                        FlushOp::Put {
                            key: DiskDocKey::committed(&item.key),
                            doc: DiskDoc::from_item(item),
                        },
                    );
                    // The prepared-space entry becomes a tombstone, stamped
                    // with the prepare's seqno and completion time so that
                    // compaction can purge it below the completed watermark.
                    let mut tombstone = DiskDoc::from_item(item);
                    tombstone.value = Vec::new();
                    tombstone.deleted = true;
                    tombstone.expiry = now_secs();
                    tombstone.committed = crate::item::CommittedState::PrepareCommitted;
                    if let Some(prepare_seqno) = item.prepare_seqno {
                        tombstone.by_seqno = prepare_seqno;
                    }
                    push_op(
                        &mut ops,
                        FlushOp::Put {
                            key: DiskDocKey::prepared(&item.key),
                            doc: tombstone,
                        },
                    );
                }
                QueueOp::AbortSyncWrite => {
                    let mut tombstone = DiskDoc::from_item(item);
                    if let Some(prepare_seqno) = item.prepare_seqno {
                        tombstone.by_seqno = prepare_seqno;
                    }
                    push_op(
                        &mut ops,
                        FlushOp::Put {
                            key: DiskDocKey::prepared(&item.key),
                            doc: tombstone,
                        },
                    );
                }
                QueueOp::CheckpointStart | QueueOp::CheckpointEnd | QueueOp::SetVBucketState => {}
            }
        }

        let batch = FlushBatch { ops };
        let vbstate = vb.build_vbstate(collected.checkpoint_id, high_seqno);

        match self.kvstore.commit(vb.id(), &batch, &vbstate) {
            Ok(outcome) => {
                let advance = cm
                    .advance_cursor(PERSISTENCE_CURSOR, collected.end)
                    .map_err(|e| {
                        KVStoreError::Corrupt(format!("persistence cursor lost: {e}"))
                    })?;
                self.destroyer.queue_for_destruction(advance.detached);
                vb.on_flush_success(
                    num_flushed,
                    outcome.committed_inserts,
                    outcome.committed_deletes,
                    high_seqno,
                );
                self.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .items_flushed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(
                    vbid = vb.id(),
                    num_flushed,
                    high_seqno,
                    more = collected.more_available,
                    "flushed vbucket"
                );
                Ok(FlushResult {
                    more_available: collected.more_available,
                    num_flushed,
                    wake_checkpoint_remover: advance.unreferenced_remain,
                })
            }
            Err(err) => {
                self.stats
                    .flusher_commit_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(vbid = vb.id(), %err, "flush commit failed, will retry");
                Err(err)
            }
        }
    }
}
