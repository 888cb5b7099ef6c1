//! In-memory checkpoints: ordered segments of the per-vBucket mutation log.
//!
//! A checkpoint owns a contiguous run of queued items belonging to one
//! snapshot range. Exactly one checkpoint per vBucket is open at any time;
//! closed checkpoints are immutable apart from reclamation (item expelling
//! and, once unreferenced, removal). Cursors address items by
//! `(checkpoint id, absolute offset)`; offsets are stable for the lifetime of
//! the checkpoint, so expelling and in-checkpoint deduplication blank the
//! affected slot instead of shifting later items.

mod destroyer;
mod manager;
mod remover;

pub use destroyer::CheckpointDestroyer;
pub use manager::{
    AdvanceResult, CheckpointManager, CursorPos, ItemsForCursor, RemovalResult,
    PERSISTENCE_CURSOR,
};
pub use remover::{CheckpointRemover, ReclamationOutcome};

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::item::{DocKey, KeySpace, QueuedItemPtr, Seqno};

/// Monotonic per-vBucket checkpoint identifier.
pub type CheckpointId = u64;

/// Origin of a checkpoint's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointType {
    /// Locally generated mutations on an active vBucket.
    Memory,
    /// Replica snapshot streamed from disk (backfill).
    Disk,
    /// The first disk snapshot a replica receives.
    InitialDisk,
}

impl CheckpointType {
    /// Disk-sourced checkpoints may be split across flusher batches.
    #[inline]
    pub const fn splittable(&self) -> bool {
        matches!(self, CheckpointType::Disk | CheckpointType::InitialDisk)
    }
}

/// Open/closed state of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    /// Accepting new items at the tail.
    Open,
    /// Immutable; eligible for reclamation once unreferenced.
    Closed,
}

/// Result of expelling items from a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpelResult {
    /// Items expelled.
    pub count: usize,
    /// Estimated bytes released.
    pub memory: usize,
}

impl ExpelResult {
    /// Accumulate another result into this one.
    pub fn merge(&mut self, other: ExpelResult) {
        self.count += other.count;
        self.memory += other.memory;
    }
}

/// One checkpoint: a run of items plus its per-keyspace dedup index.
#[derive(Debug)]
pub struct Checkpoint {
    id: CheckpointId,
    ckpt_type: CheckpointType,
    state: CheckpointState,
    snap_start: Seqno,
    snap_end: Seqno,
    /// Slots in append order. `None` marks a deduplicated or expelled slot.
    items: VecDeque<Option<QueuedItemPtr>>,
    /// Absolute offset of `items[0]`.
    base_offset: u64,
    /// Absolute offset of the `CheckpointStart` meta item (never expelled).
    start_offset: u64,
    key_index: HashMap<(KeySpace, DocKey), u64>,
    num_non_meta: usize,
    mem_usage: usize,
    high_completed_seqno: Option<Seqno>,
    num_cursors: usize,
}

impl Checkpoint {
    /// Create an open checkpoint whose first item is the start meta.
    pub(crate) fn open(
        id: CheckpointId,
        ckpt_type: CheckpointType,
        snap_start: Seqno,
        snap_end: Seqno,
        base_offset: u64,
        start_meta: QueuedItemPtr,
    ) -> Self {
        let mut ckpt = Self {
            id,
            ckpt_type,
            state: CheckpointState::Open,
            snap_start,
            snap_end,
            items: VecDeque::new(),
            base_offset,
            start_offset: base_offset,
            key_index: HashMap::new(),
            num_non_meta: 0,
            mem_usage: 0,
            high_completed_seqno: None,
            num_cursors: 0,
        };
        ckpt.push(start_meta);
        ckpt
    }

    /// Checkpoint id.
    pub fn id(&self) -> CheckpointId {
        self.id
    }

    /// Snapshot type.
    pub fn checkpoint_type(&self) -> CheckpointType {
        self.ckpt_type
    }

    /// Open or closed.
    pub fn state(&self) -> CheckpointState {
        self.state
    }

    /// Snapshot range `[start, end]`.
    pub fn snapshot(&self) -> (Seqno, Seqno) {
        (self.snap_start, self.snap_end)
    }

    /// High-completed-seqno recorded when the checkpoint closed.
    pub fn high_completed_seqno(&self) -> Option<Seqno> {
        self.high_completed_seqno
    }

    /// Number of registered cursors currently inside this checkpoint.
    pub fn num_cursors(&self) -> usize {
        self.num_cursors
    }

    /// Number of live non-meta items.
    pub fn num_items(&self) -> usize {
        self.num_non_meta
    }

    /// Estimated heap usage of the queued items.
    pub fn mem_usage(&self) -> usize {
        self.mem_usage
    }

    /// Absolute offset the next appended item will receive.
    pub fn next_offset(&self) -> u64 {
        self.base_offset + self.items.len() as u64
    }

    /// Absolute offset of the first slot.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub(crate) fn set_state(&mut self, state: CheckpointState) {
        self.state = state;
    }

    pub(crate) fn set_high_completed_seqno(&mut self, hcs: Option<Seqno>) {
        self.high_completed_seqno = hcs;
    }

    pub(crate) fn inc_cursors(&mut self) {
        self.num_cursors += 1;
    }

    pub(crate) fn dec_cursors(&mut self) {
        debug_assert!(self.num_cursors > 0);
        self.num_cursors = self.num_cursors.saturating_sub(1);
    }

    /// Removable: closed with no cursor inside.
    pub fn is_unreferenced(&self) -> bool {
        self.state == CheckpointState::Closed && self.num_cursors == 0
    }

    /// Extend the snapshot end; used as items append to an open Memory
    /// checkpoint.
    pub(crate) fn extend_snapshot(&mut self, seqno: Seqno) {
        if seqno > self.snap_end {
            self.snap_end = seqno;
        }
    }

    /// Append an item at the tail, indexing its key.
    pub(crate) fn push(&mut self, item: QueuedItemPtr) -> u64 {
        let offset = self.next_offset();
        self.mem_usage += item.mem_usage();
        if !item.is_meta() {
            self.num_non_meta += 1;
        }
        if let Some(space) = item.key_space() {
            self.key_index.insert((space, item.key.clone()), offset);
        }
        self.items.push_back(Some(item));
        offset
    }

    /// Offset of the live entry for `key` in `space`, if indexed.
    pub(crate) fn lookup(&self, space: KeySpace, key: &DocKey) -> Option<u64> {
        self.key_index.get(&(space, key.clone())).copied()
    }

    /// Blank the slot at `offset` (dedup). Returns the displaced item.
    pub(crate) fn invalidate(&mut self, offset: u64) -> Option<QueuedItemPtr> {
        let idx = offset.checked_sub(self.base_offset)? as usize;
        let slot = self.items.get_mut(idx)?;
        let item = slot.take()?;
        self.mem_usage = self.mem_usage.saturating_sub(item.mem_usage());
        if !item.is_meta() {
            self.num_non_meta = self.num_non_meta.saturating_sub(1);
        }
        Some(item)
    }

    /// Item at an absolute offset, if present and not blanked.
    pub(crate) fn item_at(&self, offset: u64) -> Option<&QueuedItemPtr> {
        let idx = offset.checked_sub(self.base_offset)? as usize;
        self.items.get(idx)?.as_ref()
    }

    /// Iterate live items with absolute offset ≥ `from`.
    pub(crate) fn iter_from(
        &self,
        from: u64,
    ) -> impl Iterator<Item = (u64, &QueuedItemPtr)> + '_ {
        let start = from.max(self.base_offset);
        let skip = (start - self.base_offset) as usize;
        self.items
            .iter()
            .enumerate()
            .skip(skip)
            .filter_map(move |(i, slot)| {
                slot.as_ref().map(|item| (self.base_offset + i as u64, item))
            })
    }

    /// Count live non-meta items at absolute offsets ≥ `from`.
    pub(crate) fn num_items_from(&self, from: u64) -> usize {
        self.iter_from(from)
            .filter(|(_, item)| !item.is_meta())
            .count()
    }

    /// Expel live non-meta items with offsets in `(start_offset, limit)`.
    /// The start meta survives so the snapshot skeleton stays intact.
    pub(crate) fn expel_below(&mut self, limit: u64) -> ExpelResult {
        let mut result = ExpelResult::default();
        let lo = self.start_offset + 1;
        let hi = limit.min(self.next_offset());
        for offset in lo..hi {
            let idx = (offset - self.base_offset) as usize;
            let Some(slot) = self.items.get_mut(idx) else {
                continue;
            };
            let Some(item) = slot.as_ref() else { continue };
            if item.is_meta() {
                continue;
            }
            let mem = item.mem_usage();
            if let Some(space) = item.key_space() {
                // Only drop the index entry if it still points at this slot.
                if self.key_index.get(&(space, item.key.clone())) == Some(&offset) {
                    self.key_index.remove(&(space, item.key.clone()));
                }
            }
            *slot = None;
            self.mem_usage = self.mem_usage.saturating_sub(mem);
            self.num_non_meta = self.num_non_meta.saturating_sub(1);
            result.count += 1;
            result.memory += mem;
        }
        result
    }
}
