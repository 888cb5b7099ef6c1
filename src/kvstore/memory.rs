//! In-memory KVStore.
//!
//! Backs the default persistent bucket in tests and development. Commits are
//! atomic under one lock; there is no real durability, but the visible
//! semantics (key spaces, vbstate, compaction, rollback) match the contract.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::item::{CommittedState, Seqno};
use crate::kvstore::{
    CommitOutcome, CompactionCallbacks, CompactionConfig, CompactionResult, DiskDoc, DiskDocKey,
    FlushBatch, FlushOp, KVStore, KVStoreError, PersistedVBState, RollbackResult, ScanItem, Vbid,
};

#[derive(Debug, Default)]
struct VbData {
    docs: BTreeMap<Vec<u8>, DiskDoc>,
    vbstate: Option<PersistedVBState>,
}

/// Hash-map-backed KVStore.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    vbs: Mutex<HashMap<Vbid, VbData>>,
}

impl MemoryKvStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed-space alive documents for a vBucket.
    pub fn num_committed_alive(&self, vbid: Vbid) -> usize {
        let vbs = self.vbs.lock();
        match vbs.get(&vbid) {
            Some(data) => data
                .docs
                .values()
                .filter(|doc| doc.is_alive_committed())
                .count(),
            None => 0,
        }
    }

    /// Total records (both key spaces, tombstones included).
    pub fn num_records(&self, vbid: Vbid) -> usize {
        let vbs = self.vbs.lock();
        vbs.get(&vbid).map(|d| d.docs.len()).unwrap_or(0)
    }
}

impl KVStore for MemoryKvStore {
    fn put(&self, vbid: Vbid, key: &DiskDocKey, doc: DiskDoc) -> Result<(), KVStoreError> {
        let mut vbs = self.vbs.lock();
        vbs.entry(vbid).or_default().docs.insert(key.encoded(), doc);
        Ok(())
    }

    fn get(&self, vbid: Vbid, key: &DiskDocKey) -> Result<Option<DiskDoc>, KVStoreError> {
        let vbs = self.vbs.lock();
        Ok(vbs
            .get(&vbid)
            .and_then(|data| data.docs.get(&key.encoded()).cloned()))
    }

    fn delete(&self, vbid: Vbid, key: &DiskDocKey) -> Result<(), KVStoreError> {
        let mut vbs = self.vbs.lock();
        if let Some(data) = vbs.get_mut(&vbid) {
            data.docs.remove(&key.encoded());
        }
        Ok(())
    }

    fn commit(
        &self,
        vbid: Vbid,
        batch: &FlushBatch,
        vbstate: &PersistedVBState,
    ) -> Result<CommitOutcome, KVStoreError> {
        let mut vbs = self.vbs.lock();
        let data = vbs.entry(vbid).or_default();
        let mut outcome = CommitOutcome::default();
        for op in &batch.ops {
            match op {
                FlushOp::Put { key, doc } => {
                    let encoded = key.encoded();
                    let prev_alive = data
                        .docs
                        .get(&encoded)
                        .is_some_and(|d| d.is_alive_committed());
                    let now_alive = doc.is_alive_committed();
                    if !key.is_prepared() {
                        match (prev_alive, now_alive) {
                            (false, true) => outcome.committed_inserts += 1,
                            (true, false) => outcome.committed_deletes += 1,
                            _ => {}
                        }
                    }
                    data.docs.insert(encoded, doc.clone());
                }
                FlushOp::Delete { key } => {
                    let removed = data.docs.remove(&key.encoded());
                    if !key.is_prepared()
                        && removed.is_some_and(|d| d.is_alive_committed())
                    {
                        outcome.committed_deletes += 1;
                    }
                }
            }
        }
        data.vbstate = Some(vbstate.clone());
        Ok(outcome)
    }

    fn get_vbucket_state(&self, vbid: Vbid) -> Result<Option<PersistedVBState>, KVStoreError> {
        let vbs = self.vbs.lock();
        Ok(vbs.get(&vbid).and_then(|data| data.vbstate.clone()))
    }

    fn scan_by_seqno(
        &self,
        vbid: Vbid,
        low: Seqno,
        high: Seqno,
    ) -> Result<Vec<ScanItem>, KVStoreError> {
        let vbs = self.vbs.lock();
        let Some(data) = vbs.get(&vbid) else {
            return Ok(Vec::new());
        };
        let mut items: Vec<ScanItem> = data
            .docs
            .iter()
            .filter(|(_, doc)| doc.by_seqno >= low && doc.by_seqno <= high)
            .filter_map(|(raw, doc)| {
                DiskDocKey::decode(raw).map(|key| ScanItem {
                    key,
                    doc: doc.clone(),
                })
            })
            .collect();
        items.sort_by_key(|item| item.doc.by_seqno);
        Ok(items)
    }

    fn compact(
        &self,
        vbid: Vbid,
        config: &CompactionConfig,
        callbacks: &mut CompactionCallbacks<'_>,
    ) -> Result<CompactionResult, KVStoreError> {
        let mut vbs = self.vbs.lock();
        let Some(data) = vbs.get_mut(&vbid) else {
            return Ok(CompactionResult::default());
        };
        let mut result = CompactionResult::default();
        let mut purge: Vec<Vec<u8>> = Vec::new();
        for (raw, doc) in &data.docs {
            let Some(key) = DiskDocKey::decode(raw) else {
                continue;
            };
            if key.is_prepared() {
                // Completed prepares below the persisted HCS are purged.
                // In-flight prepares are never touched, and never expired:
                // their expiry field may carry a deletion timestamp, so the
                // decision is taken on committed-state alone.
                let completed = matches!(
                    doc.committed,
                    CommittedState::PrepareCommitted | CommittedState::PrepareAborted
                );
                if completed && doc.by_seqno <= config.drop_prepares_below {
                    (callbacks.drop_key)(
                        &key,
                        doc.by_seqno,
                        doc.committed == CommittedState::PrepareAborted,
                    );
                    purge.push(raw.clone());
                    result.purged_prepares += 1;
                }
                continue;
            }
            if doc.deleted {
                if doc.expiry != 0 && doc.expiry < config.purge_tombstones_before {
                    purge.push(raw.clone());
                    result.purged_tombstones += 1;
                }
                continue;
            }
            if doc.committed.is_committed() && doc.expiry != 0 && doc.expiry <= config.now_secs {
                (callbacks.expiry)(&key, doc);
                result.expired += 1;
            }
        }
        for raw in purge {
            data.docs.remove(&raw);
        }
        Ok(result)
    }

    fn rollback(&self, vbid: Vbid, target_seqno: Seqno) -> Result<RollbackResult, KVStoreError> {
        let mut vbs = self.vbs.lock();
        let Some(data) = vbs.get_mut(&vbid) else {
            return Ok(RollbackResult {
                success: true,
                rollback_seqno: 0,
            });
        };
        if target_seqno == 0 {
            data.docs.clear();
            data.vbstate = None;
            return Ok(RollbackResult {
                success: false,
                rollback_seqno: 0,
            });
        }
        // Overwritten history is not retained here, so rolling back means
        // discarding every record above the target.
        data.docs.retain(|_, doc| doc.by_seqno <= target_seqno);
        if let Some(vbstate) = &mut data.vbstate {
            vbstate.high_seqno = vbstate.high_seqno.min(target_seqno);
            vbstate.high_prepared_seqno = vbstate.high_prepared_seqno.min(target_seqno);
            vbstate.high_completed_seqno = vbstate.high_completed_seqno.min(target_seqno);
        }
        Ok(RollbackResult {
            success: true,
            rollback_seqno: target_seqno,
        })
    }

    fn delete_vbucket(&self, vbid: Vbid) -> Result<(), KVStoreError> {
        self.vbs.lock().remove(&vbid);
        Ok(())
    }
}
