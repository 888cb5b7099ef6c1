//! The durable store facade consumed by the flusher.
//!
//! The engine is storage-agnostic: everything below this trait (file format,
//! MVCC, block cache) belongs to the concrete store. The contract is narrow:
//! point reads, an atomic batch commit carrying the vbucket_state document,
//! a seqno-ordered scan, compaction with expiry/drop callbacks, and
//! rollback.

mod memory;

pub use memory::MemoryKvStore;

use serde::{Deserialize, Serialize};

use crate::item::{CollectionId, CommittedState, Datatype, DocKey, QueuedItem, Seqno};
use crate::topology::ReplicationTopology;
use crate::vbucket::VBucketStateKind;

/// vBucket identifier.
pub type Vbid = u16;

/// Errors surfaced by a KVStore implementation.
#[derive(Debug, thiserror::Error)]
pub enum KVStoreError {
    /// Underlying I/O failure; the flusher retries the batch.
    #[error("kvstore io error: {0}")]
    Io(String),
    /// The store's data failed validation.
    #[error("kvstore corruption: {0}")]
    Corrupt(String),
}

/// On-disk key: a prepared/committed discriminator byte followed by the
/// collection-prefixed document key, so both key spaces coexist in one
/// ordered namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskDocKey {
    prepared: bool,
    key: DocKey,
}

const COMMITTED_PREFIX: u8 = 0x00;
const PREPARED_PREFIX: u8 = 0x01;

impl DiskDocKey {
    /// Committed-space disk key.
    pub fn committed(key: &DocKey) -> Self {
        Self {
            prepared: false,
            key: key.clone(),
        }
    }

    /// Prepared-space disk key.
    pub fn prepared(key: &DocKey) -> Self {
        Self {
            prepared: true,
            key: key.clone(),
        }
    }

    /// Whether this addresses the prepared key space.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// The logical document key.
    pub fn doc_key(&self) -> &DocKey {
        &self.key
    }

    /// Wire encoding: `[flag byte || collection leb128 || key bytes]`.
    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key.bytes().len() + 3);
        out.push(if self.prepared {
            PREPARED_PREFIX
        } else {
            COMMITTED_PREFIX
        });
        out.extend_from_slice(&self.key.encoded());
        out
    }

    /// Decode a wire-encoded disk key.
    pub fn decode(input: &[u8]) -> Option<Self> {
        let (&flag, rest) = input.split_first()?;
        let prepared = match flag {
            COMMITTED_PREFIX => false,
            PREPARED_PREFIX => true,
            _ => return None,
        };
        let (cid, used) = CollectionId::decode(rest)?;
        Some(Self {
            prepared,
            key: DocKey::in_collection(cid, rest[used..].to_vec()),
        })
    }
}

/// Document record as handed to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskDoc {
    /// Value bytes; empty for tombstones.
    pub value: Vec<u8>,
    /// Value datatype bits.
    pub datatype: Datatype,
    /// Client flags.
    pub flags: u32,
    /// Expiry (absolute seconds) or, for deletes and completed prepares, the
    /// deletion timestamp. The compactor discriminates on `committed`, never
    /// on this field.
    pub expiry: u32,
    /// Version stamp.
    pub cas: u64,
    /// Sequence number of the mutation.
    pub by_seqno: Seqno,
    /// Revision counter.
    pub rev_seqno: u64,
    /// Whether this record is a delete.
    pub deleted: bool,
    /// Committed-state discriminator.
    pub committed: CommittedState,
}

impl DiskDoc {
    /// Build a record from a queued item.
    pub fn from_item(item: &QueuedItem) -> Self {
        Self {
            value: item.value.clone(),
            datatype: item.datatype,
            flags: item.flags,
            expiry: item.expiry,
            cas: item.cas,
            by_seqno: item.by_seqno,
            rev_seqno: item.rev_seqno,
            deleted: item.deleted,
            committed: item.committed,
        }
    }

    /// Alive committed document.
    pub fn is_alive_committed(&self) -> bool {
        self.committed.is_committed() && !self.deleted
    }
}

/// One write in a flush batch.
#[derive(Debug, Clone)]
pub enum FlushOp {
    /// Insert or replace a record.
    Put {
        /// Disk key (carries the key-space flag).
        key: DiskDocKey,
        /// Record to store.
        doc: DiskDoc,
    },
    /// Remove a record outright.
    Delete {
        /// Disk key (carries the key-space flag).
        key: DiskDocKey,
    },
}

impl FlushOp {
    /// The disk key this op addresses.
    pub fn key(&self) -> &DiskDocKey {
        match self {
            FlushOp::Put { key, .. } => key,
            FlushOp::Delete { key } => key,
        }
    }
}

/// An atomic batch of writes plus the vbucket_state document.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    /// Writes in seqno order, already deduplicated per disk key.
    pub ops: Vec<FlushOp>,
}

impl FlushBatch {
    /// Number of writes in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch carries no writes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One entry of the failover table: a branch point in the vBucket's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    /// Random id minted when the entry was created.
    pub vb_uuid: u64,
    /// Seqno at which this history branch began.
    pub by_seqno: Seqno,
}

/// The per-vBucket vbucket_state document, persisted with every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedVBState {
    /// vBucket state at flush time.
    pub state: VBucketStateKind,
    /// Replication topology, if set.
    pub topology: Option<ReplicationTopology>,
    /// Highest persisted seqno.
    pub high_seqno: Seqno,
    /// High-prepared-seqno watermark.
    pub high_prepared_seqno: Seqno,
    /// High-completed-seqno watermark.
    pub high_completed_seqno: Seqno,
    /// Highest CAS handed out.
    pub max_cas: u64,
    /// Failover table, newest entry first.
    pub failover_table: Vec<FailoverEntry>,
    /// Seqno below which tombstones have been purged.
    pub purge_seqno: Seqno,
    /// Highest seqno of a client-visible (committed) mutation.
    pub max_visible_seqno: Seqno,
    /// Id of the checkpoint the persistence cursor last completed.
    pub checkpoint_id: u64,
    /// Whether any document may carry extended attributes.
    pub might_contain_xattrs: bool,
    /// Seqno at which the hybrid clock epoch began.
    pub hlc_epoch_seqno: Seqno,
}

impl PersistedVBState {
    /// Serialize to the stored JSON document.
    pub fn to_json(&self) -> Result<Vec<u8>, KVStoreError> {
        serde_json::to_vec(self).map_err(|e| KVStoreError::Corrupt(e.to_string()))
    }

    /// Deserialize from the stored JSON document.
    pub fn from_json(raw: &[u8]) -> Result<Self, KVStoreError> {
        serde_json::from_slice(raw).map_err(|e| KVStoreError::Corrupt(e.to_string()))
    }
}

/// Committed-keyspace cardinality changes observed by a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Alive committed documents created.
    pub committed_inserts: usize,
    /// Alive committed documents removed (tombstoned).
    pub committed_deletes: usize,
}

/// A record returned by a seqno scan.
#[derive(Debug, Clone)]
pub struct ScanItem {
    /// Disk key.
    pub key: DiskDocKey,
    /// Record.
    pub doc: DiskDoc,
}

/// Inputs to a compaction run.
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    /// Current wall-clock seconds; documents with `expiry <= now` are
    /// reported through the expiry callback.
    pub now_secs: u32,
    /// Completed prepares (committed or aborted) at or below this seqno are
    /// purged from the prepared key space.
    pub drop_prepares_below: Seqno,
    /// Committed tombstones whose deletion time is older than this are
    /// purged.
    pub purge_tombstones_before: u32,
}

/// Callbacks invoked during compaction.
pub struct CompactionCallbacks<'a> {
    /// Called for each expired committed document. The engine performs the
    /// actual deletion through its normal write path.
    pub expiry: &'a mut dyn FnMut(&DiskDocKey, &DiskDoc),
    /// Called for each purged key: `(key, seqno, is_abort)`.
    pub drop_key: &'a mut dyn FnMut(&DiskDocKey, Seqno, bool),
}

/// What a compaction run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Completed prepares purged.
    pub purged_prepares: usize,
    /// Committed tombstones purged.
    pub purged_tombstones: usize,
    /// Expired documents reported.
    pub expired: usize,
}

/// Result of a rollback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackResult {
    /// Whether a point-in-time rollback was possible; when false the store
    /// was reset and a full resync is required.
    pub success: bool,
    /// Seqno the store now ends at.
    pub rollback_seqno: Seqno,
}

/// Storage contract. One implementation serves a whole bucket; per-vBucket
/// write serialization is the store's responsibility.
pub trait KVStore: Send + Sync + 'static {
    /// Store one record outside a flush batch.
    fn put(&self, vbid: Vbid, key: &DiskDocKey, doc: DiskDoc) -> Result<(), KVStoreError>;

    /// Point read.
    fn get(&self, vbid: Vbid, key: &DiskDocKey) -> Result<Option<DiskDoc>, KVStoreError>;

    /// Remove one record outside a flush batch.
    fn delete(&self, vbid: Vbid, key: &DiskDocKey) -> Result<(), KVStoreError>;

    /// Atomically apply a flush batch together with the vbucket_state
    /// document. Either everything lands or nothing does.
    fn commit(
        &self,
        vbid: Vbid,
        batch: &FlushBatch,
        vbstate: &PersistedVBState,
    ) -> Result<CommitOutcome, KVStoreError>;

    /// The last committed vbucket_state document.
    fn get_vbucket_state(&self, vbid: Vbid) -> Result<Option<PersistedVBState>, KVStoreError>;

    /// Records with `low <= by_seqno <= high`, in seqno order.
    fn scan_by_seqno(
        &self,
        vbid: Vbid,
        low: Seqno,
        high: Seqno,
    ) -> Result<Vec<ScanItem>, KVStoreError>;

    /// Run compaction with the given callbacks.
    fn compact(
        &self,
        vbid: Vbid,
        config: &CompactionConfig,
        callbacks: &mut CompactionCallbacks<'_>,
    ) -> Result<CompactionResult, KVStoreError>;

    /// Discard everything above `target_seqno` if possible, otherwise reset
    /// the vBucket's data entirely.
    fn rollback(&self, vbid: Vbid, target_seqno: Seqno) -> Result<RollbackResult, KVStoreError>;

    /// Drop all state for a vBucket.
    fn delete_vbucket(&self, vbid: Vbid) -> Result<(), KVStoreError>;
}
