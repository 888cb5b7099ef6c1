//! Per-vBucket checkpoint list, cursor registry, and reclamation entry
//! points.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::checkpoint::{
    Checkpoint, CheckpointId, CheckpointState, CheckpointType, ExpelResult,
};
use crate::item::{KeySpace, QueueOp, QueuedItem, QueuedItemPtr, Seqno};
use crate::status::EngineError;

/// Name of the always-registered persistence cursor.
pub const PERSISTENCE_CURSOR: &str = "persistence";

/// A cursor position: the next absolute offset to read within a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPos {
    /// Checkpoint the cursor currently references.
    pub ckpt_id: CheckpointId,
    /// Absolute offset of the next unread slot.
    pub next_offset: u64,
}

/// Items collected for a cursor, without advancing it.
#[derive(Debug)]
pub struct ItemsForCursor {
    /// Collected items in order, meta items included.
    pub items: Vec<QueuedItemPtr>,
    /// Position the cursor should advance to once the batch is durable.
    pub end: CursorPos,
    /// Type of the last checkpoint visited.
    pub checkpoint_type: CheckpointType,
    /// Snapshot range of the last checkpoint visited.
    pub snapshot: (Seqno, Seqno),
    /// High-completed-seqno of the last visited checkpoint, if closed.
    pub high_completed_seqno: Option<Seqno>,
    /// Id of the last checkpoint visited.
    pub checkpoint_id: CheckpointId,
    /// Whether more items remain beyond `end`.
    pub more_available: bool,
}

/// Outcome of advancing a cursor.
#[derive(Debug, Default)]
pub struct AdvanceResult {
    /// Checkpoints detached for destruction (eager removal only).
    pub detached: Vec<Checkpoint>,
    /// Whether unreferenced closed checkpoints remain (lazy removal).
    pub unreferenced_remain: bool,
}

/// Outcome of removing closed unreferenced checkpoints.
#[derive(Debug, Default)]
pub struct RemovalResult {
    /// The detached checkpoints, front first.
    pub detached: Vec<Checkpoint>,
    /// Estimated bytes they hold.
    pub memory: usize,
}

#[derive(Debug)]
struct Inner {
    checkpoints: VecDeque<Checkpoint>,
    next_checkpoint_id: CheckpointId,
    next_seqno: Seqno,
    cursors: HashMap<String, CursorPos>,
    high_completed_seqno: Seqno,
    max_items: usize,
    eager_removal: bool,
}

/// Owner of the ordered checkpoint list for one vBucket.
#[derive(Debug)]
pub struct CheckpointManager {
    vbid: u16,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    /// Create a manager whose first open checkpoint starts after
    /// `last_seqno`, and register the persistence cursor at its beginning.
    pub fn new(vbid: u16, last_seqno: Seqno, max_items: usize, eager_removal: bool) -> Self {
        let first_seqno = last_seqno + 1;
        let start = Arc::new(QueuedItem::checkpoint_start(first_seqno, 1));
        let ckpt = Checkpoint::open(1, CheckpointType::Memory, first_seqno, first_seqno, 0, start);
        let mut cursors = HashMap::new();
        cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            CursorPos {
                ckpt_id: 1,
                next_offset: 0,
            },
        );
        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(ckpt);
        checkpoints[0].inc_cursors();
        Self {
            vbid,
            inner: Mutex::new(Inner {
                checkpoints,
                next_checkpoint_id: 2,
                next_seqno: first_seqno,
                cursors,
                high_completed_seqno: 0,
                max_items,
                eager_removal,
            }),
        }
    }

    /// Highest assigned seqno (0 if none yet).
    pub fn high_seqno(&self) -> Seqno {
        self.inner.lock().next_seqno - 1
    }

    /// Record the latest completed (committed or aborted) prepare seqno, used
    /// to stamp checkpoints as they close.
    pub fn note_high_completed_seqno(&self, hcs: Seqno) {
        let mut inner = self.inner.lock();
        if hcs > inner.high_completed_seqno {
            inner.high_completed_seqno = hcs;
        }
    }

    /// Queue a locally generated item. `build` receives the assigned seqno
    /// and must return an item carrying it; seqno assignment and the append
    /// are atomic with respect to other writers.
    pub fn queue<F>(&self, build: F) -> QueuedItemPtr
    where
        F: FnOnce(Seqno) -> QueuedItem,
    {
        let mut inner = self.inner.lock();
        let seqno = inner.next_seqno;
        let item = Arc::new(build(seqno));
        debug_assert_eq!(item.by_seqno, seqno);
        inner.next_seqno += 1;
        inner.append(item.clone());
        item
    }

    /// Queue a `SetVBucketState` meta item. Meta items do not consume a
    /// seqno; they ride at the current high seqno.
    pub fn queue_set_vbucket_state(&self) -> QueuedItemPtr {
        let mut inner = self.inner.lock();
        let seqno = inner.next_seqno.saturating_sub(1);
        let item = Arc::new(QueuedItem::set_vbucket_state(seqno));
        inner.append(item.clone());
        item
    }

    /// Queue an item received from replication, which carries its seqno.
    /// Seqnos must arrive in increasing order.
    pub fn queue_replica(&self, item: QueuedItem) -> Result<QueuedItemPtr, EngineError> {
        let mut inner = self.inner.lock();
        if item.by_seqno < inner.next_seqno {
            return Err(EngineError::NotSupported);
        }
        inner.next_seqno = item.by_seqno + 1;
        let item = Arc::new(item);
        inner.append(item.clone());
        Ok(item)
    }

    /// Close the open checkpoint and open a new one for the given replica
    /// snapshot range.
    pub fn create_snapshot_checkpoint(
        &self,
        snap_start: Seqno,
        snap_end: Seqno,
        ckpt_type: CheckpointType,
    ) {
        let mut inner = self.inner.lock();
        inner.close_open_checkpoint();
        inner.open_checkpoint(snap_start, snap_end, ckpt_type);
        if snap_start >= inner.next_seqno {
            inner.next_seqno = snap_start;
        }
    }

    /// Register a new cursor at the oldest checkpoint's first item.
    pub fn register_cursor(&self, name: &str) -> Result<CursorPos, EngineError> {
        let mut inner = self.inner.lock();
        if inner.cursors.contains_key(name) {
            return Err(EngineError::KeyExists);
        }
        let front = inner
            .checkpoints
            .front()
            .expect("checkpoint list is never empty");
        let pos = CursorPos {
            ckpt_id: front.id(),
            next_offset: front.base_offset(),
        };
        inner.cursors.insert(name.to_string(), pos);
        inner
            .checkpoints
            .front_mut()
            .expect("checkpoint list is never empty")
            .inc_cursors();
        Ok(pos)
    }

    /// Drop a cursor. The persistence cursor cannot be dropped.
    pub fn drop_cursor(&self, name: &str) -> Result<(), EngineError> {
        if name == PERSISTENCE_CURSOR {
            return Err(EngineError::InvalidArguments);
        }
        let mut inner = self.inner.lock();
        let pos = inner
            .cursors
            .remove(name)
            .ok_or(EngineError::KeyNotFound)?;
        if let Some(ckpt) = inner.checkpoint_mut(pos.ckpt_id) {
            ckpt.dec_cursors();
        }
        Ok(())
    }

    /// Collect up to `limit` non-meta items for a cursor without moving it.
    ///
    /// The limit is a soft trigger: Memory checkpoints are never split, so
    /// the batch always runs to at least a Memory checkpoint boundary; within
    /// Disk checkpoints the batch may stop mid-checkpoint.
    pub fn peek_items_for_cursor(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<ItemsForCursor, EngineError> {
        let inner = self.inner.lock();
        let mut pos = *inner.cursors.get(name).ok_or(EngineError::KeyNotFound)?;
        let mut idx = inner
            .checkpoint_index(pos.ckpt_id)
            .ok_or(EngineError::InvalidArguments)?;

        let mut items: Vec<QueuedItemPtr> = Vec::new();
        let mut non_meta = 0usize;
        loop {
            let ckpt = &inner.checkpoints[idx];
            let mut split = false;
            for (off, item) in ckpt.iter_from(pos.next_offset) {
                items.push(item.clone());
                if !item.is_meta() {
                    non_meta += 1;
                }
                pos.next_offset = off + 1;
                if ckpt.checkpoint_type().splittable() && non_meta >= limit {
                    split = true;
                    break;
                }
            }
            if split {
                break;
            }
            pos.next_offset = ckpt.next_offset();

            if ckpt.state() == CheckpointState::Closed && idx + 1 < inner.checkpoints.len() {
                if non_meta >= limit {
                    break;
                }
                idx += 1;
                let next = &inner.checkpoints[idx];
                pos = CursorPos {
                    ckpt_id: next.id(),
                    next_offset: next.base_offset(),
                };
            } else {
                break;
            }
        }

        let more_available = inner.items_remaining(pos) > 0;
        let last = &inner.checkpoints[idx];
        Ok(ItemsForCursor {
            items,
            end: pos,
            checkpoint_type: last.checkpoint_type(),
            snapshot: last.snapshot(),
            high_completed_seqno: last.high_completed_seqno(),
            checkpoint_id: last.id(),
            more_available,
        })
    }

    /// Move a cursor forward to `end`, as returned by
    /// [`Self::peek_items_for_cursor`]. In eager mode, checkpoints left
    /// unreferenced are detached and returned for destruction.
    pub fn advance_cursor(&self, name: &str, end: CursorPos) -> Result<AdvanceResult, EngineError> {
        let mut inner = self.inner.lock();
        let current = *inner.cursors.get(name).ok_or(EngineError::KeyNotFound)?;
        let cur_idx = inner
            .checkpoint_index(current.ckpt_id)
            .ok_or(EngineError::InvalidArguments)?;
        let mut end_idx = inner
            .checkpoint_index(end.ckpt_id)
            .ok_or(EngineError::InvalidArguments)?;
        if end_idx < cur_idx || (end_idx == cur_idx && end.next_offset < current.next_offset) {
            return Err(EngineError::InvalidArguments);
        }

        // If the target sits at the tail of a closed checkpoint, step into
        // the next one so the closed checkpoint can be reclaimed.
        let mut end = end;
        loop {
            let ckpt = &inner.checkpoints[end_idx];
            if ckpt.state() == CheckpointState::Closed
                && end.next_offset >= ckpt.next_offset()
                && end_idx + 1 < inner.checkpoints.len()
            {
                end_idx += 1;
                let next = &inner.checkpoints[end_idx];
                end = CursorPos {
                    ckpt_id: next.id(),
                    next_offset: next.base_offset(),
                };
            } else {
                break;
            }
        }

        if end.ckpt_id != current.ckpt_id {
            if let Some(ckpt) = inner.checkpoint_mut(current.ckpt_id) {
                ckpt.dec_cursors();
            }
            if let Some(ckpt) = inner.checkpoint_mut(end.ckpt_id) {
                ckpt.inc_cursors();
            }
        }
        inner.cursors.insert(name.to_string(), end);

        let mut result = AdvanceResult::default();
        if inner.eager_removal {
            result.detached = inner.detach_unreferenced();
            if !result.detached.is_empty() {
                trace!(
                    vbid = self.vbid,
                    count = result.detached.len(),
                    "eagerly detached unreferenced checkpoints"
                );
            }
        } else {
            result.unreferenced_remain = inner
                .checkpoints
                .front()
                .is_some_and(|c| c.is_unreferenced());
        }
        Ok(result)
    }

    /// Count of non-meta items the cursor has not yet consumed.
    pub fn num_items_for_cursor(&self, name: &str) -> usize {
        let inner = self.inner.lock();
        match inner.cursors.get(name) {
            Some(pos) => inner.items_remaining(*pos),
            None => 0,
        }
    }

    /// Current cursor position.
    pub fn cursor_pos(&self, name: &str) -> Option<CursorPos> {
        self.inner.lock().cursors.get(name).copied()
    }

    /// Registered cursor names.
    pub fn cursor_names(&self) -> Vec<String> {
        self.inner.lock().cursors.keys().cloned().collect()
    }

    /// Detach all closed checkpoints with no registered cursors, front
    /// first.
    pub fn remove_closed_unref_checkpoints(&self) -> RemovalResult {
        let mut inner = self.inner.lock();
        let detached = inner.detach_unreferenced();
        let memory = detached.iter().map(|c| c.mem_usage()).sum();
        if !detached.is_empty() {
            debug!(
                vbid = self.vbid,
                count = detached.len(),
                memory,
                "removed closed unreferenced checkpoints"
            );
        }
        RemovalResult { detached, memory }
    }

    /// Expel items from closed checkpoints strictly below every cursor.
    pub fn expel_unreferenced_items(&self) -> ExpelResult {
        let mut inner = self.inner.lock();
        let Some(min_pos) = inner.min_cursor_pos() else {
            return ExpelResult::default();
        };
        let Some(min_idx) = inner.checkpoint_index(min_pos.ckpt_id) else {
            return ExpelResult::default();
        };

        let mut result = ExpelResult::default();
        for idx in 0..=min_idx {
            let ckpt = &mut inner.checkpoints[idx];
            if ckpt.state() != CheckpointState::Closed {
                continue;
            }
            let limit = if idx == min_idx {
                min_pos.next_offset
            } else {
                ckpt.next_offset()
            };
            result.merge(ckpt.expel_below(limit));
        }
        result
    }

    /// Drop the replication cursor that has made least progress, if any.
    /// Returns its name so the stream layer can switch to backfill.
    pub fn drop_slowest_replication_cursor(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        let victim = inner
            .cursors
            .iter()
            .filter(|(name, _)| name.as_str() != PERSISTENCE_CURSOR)
            .min_by_key(|(_, pos)| {
                (
                    inner.checkpoint_index(pos.ckpt_id).unwrap_or(usize::MAX),
                    pos.next_offset,
                )
            })
            .map(|(name, pos)| (name.clone(), *pos));
        let (name, pos) = victim?;
        inner.cursors.remove(&name);
        if let Some(ckpt) = inner.checkpoint_mut(pos.ckpt_id) {
            ckpt.dec_cursors();
        }
        debug!(vbid = self.vbid, cursor = %name, "dropped slow replication cursor");
        Some(name)
    }

    /// Estimated heap usage of all checkpoints.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().checkpoints.iter().map(|c| c.mem_usage()).sum()
    }

    /// Number of checkpoints currently in the list.
    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Reset to a single fresh open checkpoint starting after `last_seqno`,
    /// dropping every item and cursor except a re-registered persistence
    /// cursor. Used after rollback.
    pub fn reset(&self, last_seqno: Seqno) {
        let mut inner = self.inner.lock();
        let first_seqno = last_seqno + 1;
        let start = Arc::new(QueuedItem::checkpoint_start(first_seqno, 1));
        let mut ckpt =
            Checkpoint::open(1, CheckpointType::Memory, first_seqno, first_seqno, 0, start);
        ckpt.inc_cursors();
        inner.checkpoints.clear();
        inner.checkpoints.push_back(ckpt);
        inner.next_checkpoint_id = 2;
        inner.next_seqno = first_seqno;
        inner.cursors.clear();
        inner.cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            CursorPos {
                ckpt_id: 1,
                next_offset: 0,
            },
        );
        inner.high_completed_seqno = 0;
    }

    /// Snapshot range of the open checkpoint.
    pub fn open_snapshot(&self) -> (Seqno, Seqno) {
        let inner = self.inner.lock();
        inner
            .checkpoints
            .back()
            .expect("checkpoint list is never empty")
            .snapshot()
    }
}

impl Inner {
    fn checkpoint_index(&self, id: CheckpointId) -> Option<usize> {
        // Ids are assigned monotonically and the list is ordered.
        self.checkpoints
            .binary_search_by_key(&id, |c| c.id())
            .ok()
    }

    fn checkpoint_mut(&mut self, id: CheckpointId) -> Option<&mut Checkpoint> {
        let idx = self.checkpoint_index(id)?;
        self.checkpoints.get_mut(idx)
    }

    fn global_next_offset(&self) -> u64 {
        self.checkpoints
            .back()
            .map(|c| c.next_offset())
            .unwrap_or(0)
    }

    fn open_checkpoint(&mut self, snap_start: Seqno, snap_end: Seqno, ckpt_type: CheckpointType) {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        let base = self.global_next_offset();
        let start = Arc::new(QueuedItem::checkpoint_start(snap_start, id));
        self.checkpoints.push_back(Checkpoint::open(
            id, ckpt_type, snap_start, snap_end, base, start,
        ));
    }

    fn close_open_checkpoint(&mut self) {
        let end_seqno = self.next_seqno.saturating_sub(1);
        let hcs = self.high_completed_seqno;
        let ckpt = self
            .checkpoints
            .back_mut()
            .expect("checkpoint list is never empty");
        let id = ckpt.id();
        ckpt.push(Arc::new(QueuedItem::checkpoint_end(end_seqno, id)));
        ckpt.set_state(CheckpointState::Closed);
        ckpt.set_high_completed_seqno(if hcs > 0 { Some(hcs) } else { None });
    }

    fn append(&mut self, item: QueuedItemPtr) {
        let open = self
            .checkpoints
            .back()
            .expect("checkpoint list is never empty");

        let force_new = match item.op {
            QueueOp::CommitSyncWrite | QueueOp::AbortSyncWrite => true,
            QueueOp::PendingSyncWrite => {
                open.lookup(KeySpace::Committed, &item.key).is_some()
            }
            _ => false,
        } || open.num_items() >= self.max_items;

        if force_new {
            self.close_open_checkpoint();
            let ckpt_type = CheckpointType::Memory;
            self.open_checkpoint(item.by_seqno, item.by_seqno, ckpt_type);
        }

        // In-checkpoint dedup of committed-space mutations: blank the older
        // slot unless a cursor has already consumed it, in which case both
        // versions stay and flush-time dedup resolves them.
        if !item.op.is_durability_op() && item.key_space() == Some(KeySpace::Committed) {
            let open = self
                .checkpoints
                .back()
                .expect("checkpoint list is never empty");
            let open_id = open.id();
            if let Some(off) = open.lookup(KeySpace::Committed, &item.key) {
                let consumed = self
                    .cursors
                    .values()
                    .any(|pos| pos.ckpt_id == open_id && pos.next_offset > off);
                if !consumed {
                    self.checkpoints
                        .back_mut()
                        .expect("checkpoint list is never empty")
                        .invalidate(off);
                }
            }
        }

        let seqno = item.by_seqno;
        let is_meta = item.is_meta();
        let open = self
            .checkpoints
            .back_mut()
            .expect("checkpoint list is never empty");
        open.push(item);
        if !is_meta && open.checkpoint_type() == CheckpointType::Memory {
            open.extend_snapshot(seqno);
        }
    }

    fn detach_unreferenced(&mut self) -> Vec<Checkpoint> {
        let mut detached = Vec::new();
        while self.checkpoints.len() > 1 {
            let front = self
                .checkpoints
                .front()
                .expect("checkpoint list is never empty");
            if !front.is_unreferenced() {
                break;
            }
            detached.push(
                self.checkpoints
                    .pop_front()
                    .expect("checkpoint list is never empty"),
            );
        }
        detached
    }

    fn min_cursor_pos(&self) -> Option<CursorPos> {
        self.cursors
            .values()
            .min_by_key(|pos| {
                (
                    self.checkpoint_index(pos.ckpt_id).unwrap_or(usize::MAX),
                    pos.next_offset,
                )
            })
            .copied()
    }

    fn items_remaining(&self, pos: CursorPos) -> usize {
        let Some(start_idx) = self.checkpoint_index(pos.ckpt_id) else {
            return 0;
        };
        let mut total = 0;
        for (idx, ckpt) in self.checkpoints.iter().enumerate().skip(start_idx) {
            let from = if idx == start_idx {
                pos.next_offset
            } else {
                ckpt.base_offset()
            };
            total += ckpt.num_items_from(from);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{CommittedState, Datatype, DocKey, DurabilityRequirements};

    fn mutation<'a>(key: &'a str, value: &'a str) -> impl FnOnce(Seqno) -> QueuedItem + 'a {
        move |seqno| QueuedItem {
            key: DocKey::new(key),
            value: value.as_bytes().to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: seqno,
            by_seqno: seqno,
            rev_seqno: 1,
            op: QueueOp::Mutation,
            committed: CommittedState::CommittedViaMutation,
            durability: None,
            deleted: false,
            prepare_seqno: None,
        }
    }

    fn prepare<'a>(key: &'a str, value: &'a str) -> impl FnOnce(Seqno) -> QueuedItem + 'a {
        move |seqno| QueuedItem {
            key: DocKey::new(key),
            value: value.as_bytes().to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: seqno,
            by_seqno: seqno,
            rev_seqno: 1,
            op: QueueOp::PendingSyncWrite,
            committed: CommittedState::Pending,
            durability: Some(DurabilityRequirements::majority()),
            deleted: false,
            prepare_seqno: None,
        }
    }

    fn manager() -> CheckpointManager {
        CheckpointManager::new(0, 0, 1000, true)
    }

    #[test]
    fn test_seqnos_start_at_one_and_increase() {
        let cm = manager();
        assert_eq!(cm.queue(mutation("a", "1")).by_seqno, 1);
        assert_eq!(cm.queue(mutation("b", "1")).by_seqno, 2);
        assert_eq!(cm.high_seqno(), 2);
    }

    #[test]
    fn test_dedup_keeps_latest_in_one_checkpoint() {
        let cm = manager();
        cm.queue(mutation("a", "1"));
        cm.queue(mutation("a", "2"));
        cm.queue(mutation("b", "1"));

        assert_eq!(cm.num_checkpoints(), 1);
        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 100).unwrap();
        let data: Vec<_> = batch
            .items
            .iter()
            .filter(|i| !i.is_meta())
            .map(|i| (i.key.clone(), i.by_seqno))
            .collect();
        assert_eq!(
            data,
            vec![(DocKey::new("a"), 2), (DocKey::new("b"), 3)]
        );
    }

    #[test]
    fn test_prepare_after_committed_opens_new_checkpoint() {
        let cm = manager();
        cm.queue(mutation("a", "1"));
        cm.queue(prepare("a", "2"));
        assert_eq!(cm.num_checkpoints(), 2);
    }

    #[test]
    fn test_commit_always_opens_new_checkpoint() {
        let cm = manager();
        let p = cm.queue(prepare("a", "1"));
        assert_eq!(cm.num_checkpoints(), 1);
        cm.queue(|seqno| QueuedItem {
            op: QueueOp::CommitSyncWrite,
            committed: CommittedState::CommittedViaPrepare,
            by_seqno: seqno,
            durability: None,
            ..(*p).clone()
        });
        assert_eq!(cm.num_checkpoints(), 2);
    }

    #[test]
    fn test_item_count_threshold_closes_checkpoint() {
        let cm = CheckpointManager::new(0, 0, 2, true);
        cm.queue(mutation("a", "1"));
        cm.queue(mutation("b", "1"));
        assert_eq!(cm.num_checkpoints(), 1);
        cm.queue(mutation("c", "1"));
        assert_eq!(cm.num_checkpoints(), 2);
    }

    #[test]
    fn test_cursor_advance_releases_checkpoints_eagerly() {
        let cm = manager();
        cm.queue(mutation("a", "1"));
        cm.queue(prepare("a", "2")); // forces 2nd checkpoint

        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 100).unwrap();
        let advance = cm.advance_cursor(PERSISTENCE_CURSOR, batch.end).unwrap();
        // First checkpoint is now unreferenced and detached.
        assert_eq!(advance.detached.len(), 1);
        assert_eq!(advance.detached[0].id(), 1);
        assert_eq!(cm.num_checkpoints(), 1);
    }

    #[test]
    fn test_lazy_mode_leaves_unreferenced_checkpoints() {
        let cm = CheckpointManager::new(0, 0, 1000, false);
        cm.queue(mutation("a", "1"));
        cm.queue(prepare("a", "2"));

        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 100).unwrap();
        let advance = cm.advance_cursor(PERSISTENCE_CURSOR, batch.end).unwrap();
        assert!(advance.detached.is_empty());
        assert!(advance.unreferenced_remain);
        assert_eq!(cm.num_checkpoints(), 2);

        let removal = cm.remove_closed_unref_checkpoints();
        assert_eq!(removal.detached.len(), 1);
        assert!(removal.memory > 0);
        assert_eq!(cm.num_checkpoints(), 1);
    }

    #[test]
    fn test_checkpoint_with_cursor_not_removed() {
        let cm = CheckpointManager::new(0, 0, 1000, false);
        cm.queue(mutation("a", "1"));
        cm.queue(prepare("a", "2"));
        // Persistence cursor still at the beginning: nothing removable.
        let removal = cm.remove_closed_unref_checkpoints();
        assert!(removal.detached.is_empty());
        assert_eq!(cm.num_checkpoints(), 2);
    }

    #[test]
    fn test_expel_below_all_cursors() {
        let cm = CheckpointManager::new(0, 0, 1000, false);
        cm.register_cursor("stream").unwrap();
        for k in ["a", "b", "c"] {
            cm.queue(mutation(k, "v"));
        }
        cm.queue(prepare("a", "2")); // closes first checkpoint

        // Persistence consumed everything; stream is still at the start.
        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 100).unwrap();
        cm.advance_cursor(PERSISTENCE_CURSOR, batch.end).unwrap();

        // All cursors must bound expelling: stream has consumed nothing, so
        // nothing can be expelled.
        let result = cm.expel_unreferenced_items();
        assert_eq!(result.count, 0);

        // Advance the stream past the first (Memory, unsplittable)
        // checkpoint.
        let sb = cm.peek_items_for_cursor("stream", 2).unwrap();
        cm.advance_cursor("stream", sb.end).unwrap();
        let result = cm.expel_unreferenced_items();
        assert!(result.count > 0);
        assert!(result.memory > 0);
    }

    #[test]
    fn test_persistence_cursor_cannot_be_dropped() {
        let cm = manager();
        assert_eq!(
            cm.drop_cursor(PERSISTENCE_CURSOR),
            Err(EngineError::InvalidArguments)
        );
    }

    #[test]
    fn test_drop_slowest_replication_cursor() {
        let cm = manager();
        cm.register_cursor("stream-a").unwrap();
        cm.queue(mutation("a", "1"));
        let batch = cm.peek_items_for_cursor("stream-a", 100).unwrap();
        cm.advance_cursor("stream-a", batch.end).unwrap();
        cm.register_cursor("stream-b").unwrap(); // behind stream-a

        let dropped = cm.drop_slowest_replication_cursor().unwrap();
        assert_eq!(dropped, "stream-b");
        assert!(cm.cursor_pos("stream-b").is_none());
        assert!(cm.cursor_pos("stream-a").is_some());
    }

    #[test]
    fn test_replica_items_must_be_in_order() {
        let cm = manager();
        cm.create_snapshot_checkpoint(1, 3, CheckpointType::Disk);
        let item = mutation("a", "1")(2);
        assert!(cm.queue_replica(item).is_ok());
        // Same or lower seqno must be rejected.
        let stale = mutation("b", "1")(2);
        assert_eq!(cm.queue_replica(stale), Err(EngineError::NotSupported));
    }

    #[test]
    fn test_memory_checkpoints_not_split() {
        let cm = manager();
        for i in 0..10 {
            cm.queue(mutation(&format!("k{i}"), "v"));
        }
        // Limit 3, but the open Memory checkpoint is not splittable: the
        // whole available run comes back.
        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 3).unwrap();
        let non_meta = batch.items.iter().filter(|i| !i.is_meta()).count();
        assert_eq!(non_meta, 10);
        assert!(!batch.more_available);
    }

    #[test]
    fn test_disk_checkpoints_split_at_limit() {
        let cm = manager();
        cm.create_snapshot_checkpoint(1, 10, CheckpointType::Disk);
        for i in 1..=10u64 {
            let mut item = mutation("k", "v")(i);
            item.key = DocKey::new(format!("k{i}"));
            cm.queue_replica(item).unwrap();
        }
        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 4).unwrap();
        let non_meta = batch.items.iter().filter(|i| !i.is_meta()).count();
        assert_eq!(non_meta, 4);
        assert!(batch.more_available);
    }
}
