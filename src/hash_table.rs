//! Striped in-memory hash table mapping keys to their latest stored values.
//!
//! Each key may hold at most one entry per key space: the committed document
//! visible to clients, and an in-flight prepared SyncWrite. Stripe locks are
//! leaf locks: they are never held across KVStore I/O or a checkpoint append,
//! so updates apply latest-seqno-wins to stay consistent with the checkpoint
//! order regardless of interleaving.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use crate::item::{
    CommittedState, Datatype, DocKey, DurabilityRequirements, QueuedItem, Seqno,
};

/// Latest stored value for one key in one key space.
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// Value bytes.
    pub value: Vec<u8>,
    /// Value datatype bits.
    pub datatype: Datatype,
    /// Client flags.
    pub flags: u32,
    /// Expiry (absolute seconds) or deletion timestamp; 0 for none.
    pub expiry: u32,
    /// Version stamp.
    pub cas: u64,
    /// Sequence number of the mutation that produced this value.
    pub by_seqno: Seqno,
    /// Revision counter.
    pub rev_seqno: u64,
    /// Whether this value is a delete.
    pub deleted: bool,
    /// Committed-state discriminator.
    pub committed: CommittedState,
    /// Durability requirements (prepared entries only).
    pub durability: Option<DurabilityRequirements>,
}

impl StoredValue {
    /// Build a stored value from a queued item.
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
            durability: item.durability,
        }
    }

    /// Alive (non-deleted) document.
    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.deleted
    }

    /// Whether the document has passed its expiry time. Prepares are never
    /// expirable: their expiry field may hold a deletion timestamp instead.
    pub fn is_expired(&self, now_secs: u32) -> bool {
        self.committed.is_committed() && !self.deleted && self.expiry != 0 && now_secs >= self.expiry
    }
}

#[derive(Debug, Default)]
struct Entry {
    committed: Option<StoredValue>,
    prepared: Option<StoredValue>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.committed.is_none() && self.prepared.is_none()
    }
}

/// Striped hash table for one vBucket.
#[derive(Debug)]
pub struct HashTable {
    stripes: Vec<Mutex<HashMap<DocKey, Entry>>>,
}

impl HashTable {
    /// Create a table with the given stripe count (minimum 1).
    pub fn new(num_stripes: usize) -> Self {
        let n = num_stripes.max(1);
        Self {
            stripes: (0..n).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, key: &DocKey) -> &Mutex<HashMap<DocKey, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    /// Latest committed value for `key`, if any.
    pub fn get_committed(&self, key: &DocKey) -> Option<StoredValue> {
        self.stripe(key)
            .lock()
            .get(key)
            .and_then(|e| e.committed.clone())
    }

    /// In-flight or completed prepared value for `key`, if any.
    pub fn get_prepared(&self, key: &DocKey) -> Option<StoredValue> {
        self.stripe(key)
            .lock()
            .get(key)
            .and_then(|e| e.prepared.clone())
    }

    /// Install `sv` in the committed space unless a newer seqno is already
    /// present. Returns the previous value.
    pub fn set_committed(&self, key: &DocKey, sv: StoredValue) -> Option<StoredValue> {
        let mut guard = self.stripe(key).lock();
        let entry = guard.entry(key.clone()).or_default();
        let prev = entry.committed.clone();
        match &entry.committed {
            Some(existing) if existing.by_seqno >= sv.by_seqno => {}
            _ => entry.committed = Some(sv),
        }
        prev
    }

    /// Install `sv` in the prepared space unless a newer seqno is already
    /// present.
    pub fn set_prepared(&self, key: &DocKey, sv: StoredValue) {
        let mut guard = self.stripe(key).lock();
        let entry = guard.entry(key.clone()).or_default();
        match &entry.prepared {
            Some(existing) if existing.by_seqno >= sv.by_seqno => {}
            _ => entry.prepared = Some(sv),
        }
    }

    /// Remove the prepared entry for `key`, returning it.
    pub fn remove_prepared(&self, key: &DocKey) -> Option<StoredValue> {
        let mut guard = self.stripe(key).lock();
        let removed = match guard.get_mut(key) {
            Some(entry) => entry.prepared.take(),
            None => None,
        };
        if let Some(entry) = guard.get(key) {
            if entry.is_empty() {
                guard.remove(key);
            }
        }
        removed
    }

    /// Remove the committed entry for `key`, returning it.
    pub fn remove_committed(&self, key: &DocKey) -> Option<StoredValue> {
        let mut guard = self.stripe(key).lock();
        let removed = match guard.get_mut(key) {
            Some(entry) => entry.committed.take(),
            None => None,
        };
        if let Some(entry) = guard.get(key) {
            if entry.is_empty() {
                guard.remove(key);
            }
        }
        removed
    }

    /// Drop every entry. Used by rollback before reloading from disk.
    pub fn clear(&self) {
        for stripe in &self.stripes {
            stripe.lock().clear();
        }
    }

    /// Number of keys with at least one entry.
    pub fn num_keys(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().len()).sum()
    }

    /// Number of keys with an in-flight prepared entry.
    pub fn num_prepared(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| {
                s.lock()
                    .values()
                    .filter(|e| {
                        e.prepared
                            .as_ref()
                            .is_some_and(|p| p.committed == CommittedState::Pending)
                    })
                    .count()
            })
            .sum()
    }
}
