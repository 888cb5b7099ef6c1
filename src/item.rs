//! Document keys, value metadata, and the queued-item record that flows
//! through the checkpoint pipeline.
//!
//! Every accepted write becomes exactly one [`QueuedItem`] with a fresh,
//! strictly monotonic per-vBucket sequence number. Meta operations
//! (checkpoint start/end, vBucket state changes) use the same record type so
//! that cursors observe a single ordered stream.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sequence number assigned per vBucket. Zero is reserved (no seqno).
pub type Seqno = u64;

/// Identifier of a collection within a bucket's keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(pub u32);

impl CollectionId {
    /// The default collection every bucket starts with.
    pub const DEFAULT: CollectionId = CollectionId(0);

    /// Append the unsigned-LEB128 encoding of this id to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut v = self.0;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decode a LEB128-prefixed id, returning the id and the bytes consumed.
    pub fn decode(input: &[u8]) -> Option<(CollectionId, usize)> {
        let mut value: u64 = 0;
        for (i, byte) in input.iter().enumerate().take(5) {
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return u32::try_from(value)
                    .ok()
                    .map(|v| (CollectionId(v), i + 1));
            }
        }
        None
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A document key: collection id plus raw key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    collection: CollectionId,
    key: Vec<u8>,
}

impl DocKey {
    /// Key in the default collection.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self::in_collection(CollectionId::DEFAULT, key)
    }

    /// Key in an explicit collection.
    pub fn in_collection(collection: CollectionId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    /// The collection this key belongs to.
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// The raw key bytes (without collection prefix).
    pub fn bytes(&self) -> &[u8] {
        &self.key
    }

    /// Collection-prefixed wire encoding.
    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key.len() + 2);
        self.collection.encode_into(&mut out);
        out.extend_from_slice(&self.key);
        out
    }

    /// Approximate heap footprint of this key.
    pub fn mem_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.capacity()
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{}:{}", self.collection, String::from_utf8_lossy(&self.key))
    }
}

/// Value datatype bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Datatype(pub u8);

impl Datatype {
    /// Uninterpreted bytes.
    pub const RAW: Datatype = Datatype(0x00);
    /// Value is JSON.
    pub const JSON: Datatype = Datatype(0x01);
    /// Value is snappy-compressed.
    pub const SNAPPY: Datatype = Datatype(0x02);
    /// Value carries extended attributes.
    pub const XATTR: Datatype = Datatype(0x04);

    /// Whether the JSON bit is set.
    #[inline]
    pub const fn is_json(&self) -> bool {
        self.0 & Self::JSON.0 != 0
    }

    /// Whether the snappy bit is set.
    #[inline]
    pub const fn is_snappy(&self) -> bool {
        self.0 & Self::SNAPPY.0 != 0
    }

    /// Whether the xattr bit is set.
    #[inline]
    pub const fn has_xattr(&self) -> bool {
        self.0 & Self::XATTR.0 != 0
    }

    /// Union of two datatypes.
    #[inline]
    pub const fn union(self, other: Datatype) -> Datatype {
        Datatype(self.0 | other.0)
    }
}

/// Durability level requested for a SyncWrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DurabilityLevel {
    /// No durability; classic asynchronous mutation.
    None = 0,
    /// Acknowledged in memory by a majority of the chain.
    Majority = 1,
    /// Majority in memory, plus persisted on the active.
    MajorityAndPersistOnMaster = 2,
    /// Persisted by a majority of the chain.
    PersistToMajority = 3,
}

impl DurabilityLevel {
    /// Decode the wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DurabilityLevel::None),
            1 => Some(DurabilityLevel::Majority),
            2 => Some(DurabilityLevel::MajorityAndPersistOnMaster),
            3 => Some(DurabilityLevel::PersistToMajority),
            _ => None,
        }
    }

    /// Whether this level requires the active node to persist the prepare
    /// before it may commit.
    #[inline]
    pub const fn requires_active_persistence(&self) -> bool {
        matches!(
            self,
            DurabilityLevel::MajorityAndPersistOnMaster | DurabilityLevel::PersistToMajority
        )
    }
}

/// SyncWrite timeout as carried on the wire: a 16-bit millisecond count with
/// two reserved encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityTimeout {
    /// Use the bucket's configured default.
    ServerDefault,
    /// Never time out.
    Infinity,
    /// Explicit timeout in milliseconds.
    Millis(u16),
}

impl DurabilityTimeout {
    /// Decode the wire field (0 = default, 65535 = infinity).
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => DurabilityTimeout::ServerDefault,
            u16::MAX => DurabilityTimeout::Infinity,
            ms => DurabilityTimeout::Millis(ms),
        }
    }

    /// Resolve to a concrete duration, or `None` for infinity.
    pub fn resolve(&self, server_default_ms: u64) -> Option<std::time::Duration> {
        match self {
            DurabilityTimeout::ServerDefault => {
                Some(std::time::Duration::from_millis(server_default_ms))
            }
            DurabilityTimeout::Infinity => None,
            DurabilityTimeout::Millis(ms) => Some(std::time::Duration::from_millis(u64::from(*ms))),
        }
    }
}

/// Durability requirements attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityRequirements {
    /// Requested level. Never `None` on a SyncWrite.
    pub level: DurabilityLevel,
    /// Requested timeout.
    pub timeout: DurabilityTimeout,
}

impl DurabilityRequirements {
    /// Majority-level requirements with the server-default timeout.
    pub fn majority() -> Self {
        Self {
            level: DurabilityLevel::Majority,
            timeout: DurabilityTimeout::ServerDefault,
        }
    }

    /// Requirements at `level` with the server-default timeout.
    pub fn new(level: DurabilityLevel) -> Self {
        Self {
            level,
            timeout: DurabilityTimeout::ServerDefault,
        }
    }
}

/// Operation tag of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueOp {
    /// Plain committed mutation.
    Mutation,
    /// Committed deletion (tombstone).
    Deletion,
    /// Deletion generated by document expiry.
    Expiration,
    /// Prepare of a SyncWrite.
    PendingSyncWrite,
    /// Commit of a previously prepared SyncWrite.
    CommitSyncWrite,
    /// Abort of a previously prepared SyncWrite.
    AbortSyncWrite,
    /// Meta: first item of every checkpoint.
    CheckpointStart,
    /// Meta: final item of a closed checkpoint.
    CheckpointEnd,
    /// Meta: vBucket state changed; forces a vbstate persist.
    SetVBucketState,
}

impl QueueOp {
    /// True for items that carry no document payload.
    #[inline]
    pub const fn is_meta(&self) -> bool {
        matches!(
            self,
            QueueOp::CheckpointStart | QueueOp::CheckpointEnd | QueueOp::SetVBucketState
        )
    }

    /// True for the three SyncWrite lifecycle operations, which are never
    /// deduplicated in a checkpoint.
    #[inline]
    pub const fn is_durability_op(&self) -> bool {
        matches!(
            self,
            QueueOp::PendingSyncWrite | QueueOp::CommitSyncWrite | QueueOp::AbortSyncWrite
        )
    }
}

/// Committed-state discriminator of a stored or queued document.
///
/// Persisted with the document so that the compactor can tell a SyncDelete
/// prepare (whose expiry field holds a deletion timestamp) apart from an
/// expirable committed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommittedState {
    /// Committed by a plain mutation.
    CommittedViaMutation,
    /// Committed by completing a SyncWrite.
    CommittedViaPrepare,
    /// In-flight prepare; lives in the prepared key space.
    Pending,
    /// Prepare whose commit has been processed.
    PrepareCommitted,
    /// Prepare that was aborted.
    PrepareAborted,
}

impl CommittedState {
    /// True for states living in the committed key space.
    #[inline]
    pub const fn is_committed(&self) -> bool {
        matches!(
            self,
            CommittedState::CommittedViaMutation | CommittedState::CommittedViaPrepare
        )
    }

    /// True for any state in the prepared key space.
    #[inline]
    pub const fn is_prepare(&self) -> bool {
        matches!(
            self,
            CommittedState::Pending
                | CommittedState::PrepareCommitted
                | CommittedState::PrepareAborted
        )
    }
}

/// The two key spaces that coexist per vBucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Committed (client-visible) documents.
    Committed,
    /// Prepared SyncWrites and their completion tombstones.
    Prepared,
}

/// A single record in the checkpoint pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    /// Document key. For meta items the key is synthetic.
    pub key: DocKey,
    /// Value bytes; empty for deletions and meta items.
    pub value: Vec<u8>,
    /// Value datatype bits.
    pub datatype: Datatype,
    /// Client flags.
    pub flags: u32,
    /// Expiry time (absolute seconds), or 0 for none. For deletions and
    /// SyncDelete prepares this field carries the deletion timestamp.
    pub expiry: u32,
    /// Version stamp from the hybrid logical clock.
    pub cas: u64,
    /// Per-vBucket sequence number; assigned at checkpoint append.
    pub by_seqno: Seqno,
    /// Revision counter for conflict resolution.
    pub rev_seqno: u64,
    /// Operation tag.
    pub op: QueueOp,
    /// Committed-state discriminator.
    pub committed: CommittedState,
    /// Durability requirements; present only on SyncWrite prepares.
    pub durability: Option<DurabilityRequirements>,
    /// Whether the document body is a delete.
    pub deleted: bool,
    /// For Commit/Abort items: seqno of the prepare being completed. The
    /// flusher stamps the prepared-space tombstone with it so compaction can
    /// purge completed prepares below the completed watermark.
    pub prepare_seqno: Option<Seqno>,
}

impl QueuedItem {
    /// The key space this item belongs to, or `None` for meta items.
    pub fn key_space(&self) -> Option<KeySpace> {
        if self.op.is_meta() {
            return None;
        }
        if self.committed.is_prepare() {
            Some(KeySpace::Prepared)
        } else {
            Some(KeySpace::Committed)
        }
    }

    /// True for items that carry no document payload.
    #[inline]
    pub fn is_meta(&self) -> bool {
        self.op.is_meta()
    }

    /// True for in-flight prepares.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.committed == CommittedState::Pending
    }

    /// Approximate heap footprint, used for checkpoint memory accounting.
    pub fn mem_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.mem_usage() + self.value.capacity()
    }

    /// Meta item opening checkpoint `id`.
    pub fn checkpoint_start(seqno: Seqno, checkpoint_id: u64) -> Self {
        Self::meta(QueueOp::CheckpointStart, seqno, checkpoint_id)
    }

    /// Meta item closing checkpoint `id`.
    pub fn checkpoint_end(seqno: Seqno, checkpoint_id: u64) -> Self {
        Self::meta(QueueOp::CheckpointEnd, seqno, checkpoint_id)
    }

    /// Meta item recording a vBucket state change.
    pub fn set_vbucket_state(seqno: Seqno) -> Self {
        Self::meta(QueueOp::SetVBucketState, seqno, 0)
    }

    fn meta(op: QueueOp, seqno: Seqno, checkpoint_id: u64) -> Self {
        let tag = match op {
            QueueOp::CheckpointStart => "checkpoint_start",
            QueueOp::CheckpointEnd => "checkpoint_end",
            _ => "set_vbucket_state",
        };
        Self {
            key: DocKey::new(format!("{tag}:{checkpoint_id}")),
            value: Vec::new(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: 0,
            by_seqno: seqno,
            rev_seqno: 0,
            op,
            committed: CommittedState::CommittedViaMutation,
            durability: None,
            deleted: false,
            prepare_seqno: None,
        }
    }
}

/// Shared handle to a queued item. Items are immutable once queued; cursors,
/// the flusher and the durability monitor all hold references to the same
/// allocation.
pub type QueuedItemPtr = Arc<QueuedItem>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_id_roundtrip() {
        for id in [0u32, 1, 0x7f, 0x80, 0x3fff, 0x4000, u32::MAX] {
            let mut buf = Vec::new();
            CollectionId(id).encode_into(&mut buf);
            let (decoded, used) = CollectionId::decode(&buf).unwrap();
            assert_eq!(decoded.0, id);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_collection_id_decode_truncated() {
        // A continuation bit with no following byte must not decode.
        assert!(CollectionId::decode(&[0x80]).is_none());
        assert!(CollectionId::decode(&[]).is_none());
    }

    #[test]
    fn test_dockey_encoding_prefixes_collection() {
        let key = DocKey::in_collection(CollectionId(0x80), "k");
        let enc = key.encoded();
        assert_eq!(enc, vec![0x80, 0x01, b'k']);

        let default = DocKey::new("k");
        assert_eq!(default.encoded(), vec![0x00, b'k']);
    }

    #[test]
    fn test_same_key_different_collections_distinct() {
        let a = DocKey::in_collection(CollectionId(1), "k");
        let b = DocKey::in_collection(CollectionId(2), "k");
        assert_ne!(a, b);
        assert_ne!(a.encoded(), b.encoded());
    }

    #[test]
    fn test_datatype_bits() {
        let dt = Datatype::JSON.union(Datatype::XATTR);
        assert!(dt.is_json());
        assert!(dt.has_xattr());
        assert!(!dt.is_snappy());
        assert!(!Datatype::RAW.is_json());
    }

    #[test]
    fn test_durability_level_wire_codes() {
        assert_eq!(DurabilityLevel::from_u8(0), Some(DurabilityLevel::None));
        assert_eq!(DurabilityLevel::from_u8(1), Some(DurabilityLevel::Majority));
        assert_eq!(
            DurabilityLevel::from_u8(2),
            Some(DurabilityLevel::MajorityAndPersistOnMaster)
        );
        assert_eq!(
            DurabilityLevel::from_u8(3),
            Some(DurabilityLevel::PersistToMajority)
        );
        assert_eq!(DurabilityLevel::from_u8(4), None);

        assert!(!DurabilityLevel::Majority.requires_active_persistence());
        assert!(DurabilityLevel::PersistToMajority.requires_active_persistence());
        assert!(DurabilityLevel::MajorityAndPersistOnMaster.requires_active_persistence());
    }

    #[test]
    fn test_timeout_reserved_encodings() {
        assert_eq!(
            DurabilityTimeout::from_raw(0),
            DurabilityTimeout::ServerDefault
        );
        assert_eq!(
            DurabilityTimeout::from_raw(u16::MAX),
            DurabilityTimeout::Infinity
        );
        assert_eq!(
            DurabilityTimeout::from_raw(1500),
            DurabilityTimeout::Millis(1500)
        );

        assert_eq!(
            DurabilityTimeout::ServerDefault.resolve(30_000),
            Some(std::time::Duration::from_millis(30_000))
        );
        assert_eq!(DurabilityTimeout::Infinity.resolve(30_000), None);
    }

    #[test]
    fn test_key_space_classification() {
        let mut item = QueuedItem {
            key: DocKey::new("k"),
            value: b"v".to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: 1,
            by_seqno: 1,
            rev_seqno: 1,
            op: QueueOp::Mutation,
            committed: CommittedState::CommittedViaMutation,
            durability: None,
            deleted: false,
            prepare_seqno: None,
        };
        assert_eq!(item.key_space(), Some(KeySpace::Committed));

        item.op = QueueOp::PendingSyncWrite;
        item.committed = CommittedState::Pending;
        assert_eq!(item.key_space(), Some(KeySpace::Prepared));

        let meta = QueuedItem::checkpoint_start(1, 1);
        assert_eq!(meta.key_space(), None);
        assert!(meta.is_meta());
    }

    #[test]
    fn test_durability_ops_never_dedup() {
        assert!(QueueOp::PendingSyncWrite.is_durability_op());
        assert!(QueueOp::CommitSyncWrite.is_durability_op());
        assert!(QueueOp::AbortSyncWrite.is_durability_op());
        assert!(!QueueOp::Mutation.is_durability_op());
        assert!(!QueueOp::CheckpointStart.is_durability_op());
    }
}
