//! The vBucket: one shard of the keyspace, the unit of replication and
//! durability.
//!
//! A vBucket integrates the striped hash table (latest value per key), the
//! checkpoint manager (ordered mutation log) and the durability monitor
//! (in-flight SyncWrites). Lock order is `state` → checkpoint manager →
//! hash-table stripe; the durability monitor lock never wraps a checkpoint
//! append, so monitor decisions are drained first and applied after.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::checkpoint::{CheckpointManager, CheckpointType};
use crate::config::EngineConfig;
use crate::durability::{
    CookieHandle, DurabilityMonitor, PassiveDurabilityMonitor, Resolution, SyncWriteResult,
};
use crate::hash_table::{HashTable, StoredValue};
use crate::hlc::HybridClock;
use crate::item::{
    CollectionId, CommittedState, Datatype, DocKey, DurabilityLevel, DurabilityRequirements,
    QueueOp, QueuedItem, QueuedItemPtr, Seqno,
};
use crate::kvstore::{FailoverEntry, PersistedVBState, Vbid};
use crate::stats::EngineStats;
use crate::status::EngineError;
use crate::topology::ReplicationTopology;

/// vBucket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VBucketStateKind {
    /// Serves client traffic and leads the durability chain.
    Active,
    /// Follows an active via the replication stream.
    Replica,
    /// Transitioning; accepts replication traffic only.
    Pending,
    /// Out of service; rejects everything.
    Dead,
}

impl VBucketStateKind {
    /// Whether this state accepts replication input.
    pub fn takes_replica_traffic(&self) -> bool {
        matches!(self, VBucketStateKind::Replica | VBucketStateKind::Pending)
    }
}

/// Result of a successfully applied mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    /// Version stamp of the stored document.
    pub cas: u64,
    /// Assigned sequence number.
    pub seqno: Seqno,
}

/// Result of a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    /// Value bytes.
    pub value: Vec<u8>,
    /// Version stamp.
    pub cas: u64,
    /// Client flags.
    pub flags: u32,
    /// Datatype bits.
    pub datatype: Datatype,
    /// Seqno of the mutation that produced this value.
    pub by_seqno: Seqno,
}

/// Options carried by a write operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Expected CAS; 0 accepts any.
    pub cas: u64,
    /// Durability requirements; absent for a classic async write.
    pub durability: Option<DurabilityRequirements>,
    /// Expiry in absolute seconds; 0 for none.
    pub expiry: u32,
    /// Client flags.
    pub flags: u32,
    /// Value datatype bits.
    pub datatype: Datatype,
}

impl WriteOptions {
    /// Options requesting the given durability level.
    pub fn durable(level: DurabilityLevel) -> Self {
        Self {
            durability: Some(DurabilityRequirements::new(level)),
            ..Default::default()
        }
    }
}

/// A record arriving over the replication stream.
#[derive(Debug, Clone)]
pub struct ReplicaItem {
    /// Document key.
    pub key: DocKey,
    /// Value bytes.
    pub value: Vec<u8>,
    /// Datatype bits. Deletions may legitimately arrive carrying
    /// `XATTR|JSON` from older producers; they are accepted as-is.
    pub datatype: Datatype,
    /// Client flags.
    pub flags: u32,
    /// Expiry seconds (or deletion time for deletes).
    pub expiry: u32,
    /// CAS assigned by the active.
    pub cas: u64,
    /// Seqno assigned by the active.
    pub by_seqno: Seqno,
    /// Revision counter.
    pub rev_seqno: u64,
    /// Whether the record is a delete.
    pub deleted: bool,
    /// Durability requirements (prepares only).
    pub durability: Option<DurabilityRequirements>,
}

enum WriteKind {
    Set,
    Add,
    Replace,
    Delete,
}

/// One shard of the keyspace.
pub struct VBucket {
    id: Vbid,
    ephemeral: bool,
    state: RwLock<VBucketStateKind>,
    hash_table: HashTable,
    checkpoint_mgr: Arc<CheckpointManager>,
    durability: Mutex<DurabilityMonitor>,
    hlc: HybridClock,
    stats: Arc<EngineStats>,
    num_items: AtomicU64,
    on_disk_items: AtomicU64,
    collection_counts: Mutex<HashMap<CollectionId, u64>>,
    failover_table: Mutex<Vec<FailoverEntry>>,
    purge_seqno: AtomicU64,
    max_visible_seqno: AtomicU64,
    might_contain_xattrs: AtomicBool,
    replica_snapshot: Mutex<Option<(Seqno, Seqno)>>,
    default_timeout_ms: u64,
    max_item_size: usize,
}

impl VBucket {
    /// Create a vBucket in the given initial state.
    pub fn new(
        id: Vbid,
        initial_state: VBucketStateKind,
        config: &EngineConfig,
        stats: Arc<EngineStats>,
        ephemeral: bool,
    ) -> Self {
        let durability = match initial_state {
            VBucketStateKind::Active => {
                DurabilityMonitor::Active(crate::durability::ActiveDurabilityMonitor::new(None))
            }
            _ => DurabilityMonitor::Passive(PassiveDurabilityMonitor::new()),
        };
        Self {
            id,
            ephemeral,
            state: RwLock::new(initial_state),
            hash_table: HashTable::new(config.hash_table_stripes),
            checkpoint_mgr: Arc::new(CheckpointManager::new(
                id,
                0,
                config.checkpoint_max_items,
                config.eager_checkpoint_removal,
            )),
            durability: Mutex::new(durability),
            hlc: HybridClock::default(),
            stats,
            num_items: AtomicU64::new(0),
            on_disk_items: AtomicU64::new(0),
            collection_counts: Mutex::new(HashMap::new()),
            failover_table: Mutex::new(Vec::new()),
            purge_seqno: AtomicU64::new(0),
            max_visible_seqno: AtomicU64::new(0),
            might_contain_xattrs: AtomicBool::new(false),
            replica_snapshot: Mutex::new(None),
            default_timeout_ms: config.durability_default_timeout_ms,
            max_item_size: config.max_item_size,
        }
    }

    /// vBucket id.
    pub fn id(&self) -> Vbid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> VBucketStateKind {
        *self.state.read()
    }

    /// The checkpoint manager (shared with the flusher and remover).
    pub fn checkpoint_manager(&self) -> &Arc<CheckpointManager> {
        &self.checkpoint_mgr
    }

    /// Highest assigned seqno.
    pub fn high_seqno(&self) -> Seqno {
        self.checkpoint_mgr.high_seqno()
    }

    /// High-prepared-seqno watermark.
    pub fn high_prepared_seqno(&self) -> Seqno {
        self.durability.lock().high_prepared_seqno()
    }

    /// High-completed-seqno watermark.
    pub fn high_completed_seqno(&self) -> Seqno {
        self.durability.lock().high_completed_seqno()
    }

    /// Client-visible item count: committed alive documents.
    pub fn num_items(&self) -> u64 {
        self.num_items.load(Ordering::Relaxed)
    }

    /// Item count persisted on disk, maintained by the flusher.
    pub fn on_disk_items(&self) -> u64 {
        self.on_disk_items.load(Ordering::Relaxed)
    }

    /// Committed alive documents in one collection.
    pub fn collection_item_count(&self, cid: CollectionId) -> u64 {
        self.collection_counts
            .lock()
            .get(&cid)
            .copied()
            .unwrap_or(0)
    }

    /// Number of in-flight prepares tracked by the durability monitor.
    pub fn num_tracked_sync_writes(&self) -> usize {
        self.durability.lock().num_tracked()
    }

    // ------------------------------------------------------------------
    // Client write path
    // ------------------------------------------------------------------

    /// Upsert. With durability set, admits a Prepare and returns
    /// [`EngineError::WouldBlock`]; the cookie receives the outcome.
    pub fn set(
        &self,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.write(key, value, opts, cookie, WriteKind::Set)
    }

    /// Insert; fails with [`EngineError::KeyExists`] if the key is alive.
    pub fn add(
        &self,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.write(key, value, opts, cookie, WriteKind::Add)
    }

    /// Update; fails with [`EngineError::KeyNotFound`] if absent.
    pub fn replace(
        &self,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.write(key, value, opts, cookie, WriteKind::Replace)
    }

    /// Delete; CAS-checked when `opts.cas` is non-zero.
    pub fn delete(
        &self,
        key: &DocKey,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.write(key, Vec::new(), opts, cookie, WriteKind::Delete)
    }

    /// Point read from the committed key space. Expired documents are
    /// deleted on sight and reported absent.
    pub fn get(&self, key: &DocKey) -> Result<GetResult, EngineError> {
        let state = self.state.read();
        if *state != VBucketStateKind::Active {
            return Err(EngineError::NotMyVBucket);
        }
        let Some(sv) = self.hash_table.get_committed(key) else {
            return Err(EngineError::KeyNotFound);
        };
        if sv.deleted {
            return Err(EngineError::KeyNotFound);
        }
        if sv.is_expired(now_secs()) {
            self.expire_document(key, &sv);
            return Err(EngineError::KeyNotFound);
        }
        Ok(GetResult {
            value: sv.value,
            cas: sv.cas,
            flags: sv.flags,
            datatype: sv.datatype,
            by_seqno: sv.by_seqno,
        })
    }

    fn write(
        &self,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
        kind: WriteKind,
    ) -> Result<MutationResult, EngineError> {
        let state = self.state.read();
        if *state != VBucketStateKind::Active {
            return Err(EngineError::NotMyVBucket);
        }
        if value.len() > self.max_item_size {
            return Err(EngineError::TooBig);
        }

        if let Some(prepared) = self.hash_table.get_prepared(key) {
            return Err(match prepared.committed {
                CommittedState::Pending => EngineError::SyncWriteInProgress,
                _ => EngineError::SyncWriteReCommitInProgress,
            });
        }

        let committed = self.hash_table.get_committed(key);
        let alive = match &committed {
            Some(sv) if sv.is_expired(now_secs()) => {
                self.expire_document(key, sv);
                false
            }
            Some(sv) => sv.is_alive(),
            None => false,
        };

        match kind {
            WriteKind::Add if alive => return Err(EngineError::KeyExists),
            WriteKind::Replace | WriteKind::Delete if !alive => {
                return Err(EngineError::KeyNotFound)
            }
            _ => {}
        }
        if opts.cas != 0 {
            match &committed {
                Some(sv) if sv.is_alive() => {
                    if sv.cas != opts.cas {
                        return Err(EngineError::CasMismatch);
                    }
                }
                _ => return Err(EngineError::KeyNotFound),
            }
        }

        let deleted = matches!(kind, WriteKind::Delete);
        let rev_seqno = committed.as_ref().map(|sv| sv.rev_seqno + 1).unwrap_or(1);

        if let Some(durability) = opts.durability {
            return self.admit_prepare(key, value, opts, durability, rev_seqno, deleted, cookie);
        }

        let cas = self.hlc.next_cas();
        if opts.datatype.has_xattr() {
            self.might_contain_xattrs.store(true, Ordering::Relaxed);
        }
        let item = self.checkpoint_mgr.queue(|seqno| QueuedItem {
            key: key.clone(),
            value,
            datatype: opts.datatype,
            flags: opts.flags,
            expiry: if deleted { now_secs() } else { opts.expiry },
            cas,
            by_seqno: seqno,
            rev_seqno,
            op: if deleted {
                QueueOp::Deletion
            } else {
                QueueOp::Mutation
            },
            committed: CommittedState::CommittedViaMutation,
            durability: None,
            deleted,
            prepare_seqno: None,
        });
        self.apply_committed(key, &item, alive);
        Ok(MutationResult {
            cas,
            seqno: item.by_seqno,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn admit_prepare(
        &self,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        durability: DurabilityRequirements,
        rev_seqno: u64,
        deleted: bool,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        if durability.level == DurabilityLevel::None {
            return Err(EngineError::InvalidArguments);
        }
        if self.ephemeral && durability.level.requires_active_persistence() {
            return Err(EngineError::DurabilityInvalidLevel);
        }
        {
            let mut dm = self.durability.lock();
            let adm = dm.as_active_mut()?;
            match adm.topology() {
                None => return Err(EngineError::DurabilityImpossible),
                Some(t) if !t.supports_sync_writes() => {
                    return Err(EngineError::DurabilityImpossible)
                }
                Some(_) => {}
            }
        }

        let cas = self.hlc.next_cas();
        // A SyncDelete prepare reuses the expiry field as its deletion
        // timestamp; the compactor discriminates on committed-state.
        let expiry = if deleted { now_secs() } else { opts.expiry };
        let item = self.checkpoint_mgr.queue(|seqno| QueuedItem {
            key: key.clone(),
            value,
            datatype: opts.datatype,
            flags: opts.flags,
            expiry,
            cas,
            by_seqno: seqno,
            rev_seqno,
            op: QueueOp::PendingSyncWrite,
            committed: CommittedState::Pending,
            durability: Some(durability),
            deleted,
            prepare_seqno: None,
        });
        self.hash_table.set_prepared(key, StoredValue::from_item(&item));
        self.stats.disk_queue_size.fetch_add(1, Ordering::Relaxed);

        let deadline = durability
            .timeout
            .resolve(self.default_timeout_ms)
            .map(|d| Instant::now() + d);
        {
            let mut dm = self.durability.lock();
            let adm = dm.as_active_mut()?;
            adm.track(item, cookie, deadline);
        }
        trace!(vbid = self.id, key = %key, "prepare admitted");
        // A one-node chain satisfies majority immediately.
        self.process_resolved_sync_writes();
        Err(EngineError::WouldBlock)
    }

    // ------------------------------------------------------------------
    // SyncWrite completion
    // ------------------------------------------------------------------

    /// Commit an outstanding prepare on the active. Normally driven by the
    /// durability monitor; exposed for takeover tooling.
    pub fn commit(&self, key: &DocKey, prepare_seqno: Seqno) -> Result<MutationResult, EngineError> {
        let cookie = {
            let mut dm = self.durability.lock();
            let adm = dm.as_active_mut()?;
            adm.remove_tracked(key, prepare_seqno).flatten()
        };
        let result = self.complete_commit(key, prepare_seqno, None)?;
        if let Some(cookie) = cookie {
            cookie.notify(SyncWriteResult::Success { cas: result.cas });
        }
        self.process_resolved_sync_writes();
        Ok(result)
    }

    /// Abort an outstanding prepare on the active.
    pub fn abort(&self, key: &DocKey, prepare_seqno: Seqno) -> Result<MutationResult, EngineError> {
        let cookie = {
            let mut dm = self.durability.lock();
            let adm = dm.as_active_mut()?;
            adm.remove_tracked(key, prepare_seqno).flatten()
        };
        let result = self.complete_abort(key, prepare_seqno, None)?;
        if let Some(cookie) = cookie {
            cookie.notify(SyncWriteResult::Ambiguous);
            self.stats
                .sync_writes_ambiguous
                .fetch_add(1, Ordering::Relaxed);
        }
        self.process_resolved_sync_writes();
        Ok(result)
    }

    /// Apply every decision the durability monitor has queued.
    pub fn process_resolved_sync_writes(&self) {
        let resolved = self.durability.lock().drain_resolved();
        for r in resolved {
            match r.resolution {
                Resolution::Commit => match self.complete_commit(&r.key, r.prepare_seqno, None) {
                    Ok(result) => {
                        self.stats
                            .sync_writes_committed
                            .fetch_add(1, Ordering::Relaxed);
                        if let Some(cookie) = r.cookie {
                            cookie.notify(SyncWriteResult::Success { cas: result.cas });
                        }
                    }
                    Err(err) => {
                        debug!(vbid = self.id, key = %r.key, %err, "commit of resolved prepare failed");
                        if let Some(cookie) = r.cookie {
                            cookie.notify(SyncWriteResult::Ambiguous);
                        }
                    }
                },
                Resolution::Abort(_) => {
                    let _ = self.complete_abort(&r.key, r.prepare_seqno, None);
                    self.stats
                        .sync_writes_aborted
                        .fetch_add(1, Ordering::Relaxed);
                    if let Some(cookie) = r.cookie {
                        cookie.notify(SyncWriteResult::Ambiguous);
                        self.stats
                            .sync_writes_ambiguous
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn complete_commit(
        &self,
        key: &DocKey,
        prepare_seqno: Seqno,
        commit_seqno: Option<Seqno>,
    ) -> Result<MutationResult, EngineError> {
        let prepared = self
            .hash_table
            .get_prepared(key)
            .ok_or(EngineError::KeyNotFound)?;
        if prepared.by_seqno != prepare_seqno {
            return Err(EngineError::InvalidArguments);
        }
        let was_alive = self
            .hash_table
            .get_committed(key)
            .is_some_and(|sv| sv.is_alive());

        let build = |seqno: Seqno| QueuedItem {
            key: key.clone(),
            value: prepared.value.clone(),
            datatype: prepared.datatype,
            flags: prepared.flags,
            expiry: prepared.expiry,
            cas: prepared.cas,
            by_seqno: seqno,
            rev_seqno: prepared.rev_seqno,
            op: QueueOp::CommitSyncWrite,
            committed: CommittedState::CommittedViaPrepare,
            durability: None,
            deleted: prepared.deleted,
            prepare_seqno: Some(prepare_seqno),
        };
        // The prepare completes with this commit; record the watermark
        // before the append so the checkpoint it closes carries it.
        self.checkpoint_mgr.note_high_completed_seqno(prepare_seqno);
        let item = match commit_seqno {
            Some(seqno) => self.checkpoint_mgr.queue_replica(build(seqno))?,
            None => self.checkpoint_mgr.queue(build),
        };
        self.hash_table.remove_prepared(key);
        self.apply_committed(key, &item, was_alive);
        Ok(MutationResult {
            cas: item.cas,
            seqno: item.by_seqno,
        })
    }

    fn complete_abort(
        &self,
        key: &DocKey,
        prepare_seqno: Seqno,
        abort_seqno: Option<Seqno>,
    ) -> Result<MutationResult, EngineError> {
        let prepared = self
            .hash_table
            .get_prepared(key)
            .ok_or(EngineError::KeyNotFound)?;
        if prepared.by_seqno != prepare_seqno {
            return Err(EngineError::InvalidArguments);
        }
        let build = |seqno: Seqno| QueuedItem {
            key: key.clone(),
            value: Vec::new(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: now_secs(),
            cas: prepared.cas,
            by_seqno: seqno,
            rev_seqno: prepared.rev_seqno,
            op: QueueOp::AbortSyncWrite,
            committed: CommittedState::PrepareAborted,
            durability: None,
            deleted: true,
            prepare_seqno: Some(prepare_seqno),
        };
        self.checkpoint_mgr.note_high_completed_seqno(prepare_seqno);
        let item = match abort_seqno {
            Some(seqno) => self.checkpoint_mgr.queue_replica(build(seqno))?,
            None => self.checkpoint_mgr.queue(build),
        };
        self.hash_table.remove_prepared(key);
        self.stats.disk_queue_size.fetch_add(1, Ordering::Relaxed);
        Ok(MutationResult {
            cas: item.cas,
            seqno: item.by_seqno,
        })
    }

    /// Install a committed item into the hash table and maintain item and
    /// collection counters.
    fn apply_committed(&self, key: &DocKey, item: &QueuedItemPtr, was_alive: bool) {
        self.hash_table
            .set_committed(key, StoredValue::from_item(item));
        match (was_alive, item.deleted) {
            (false, false) => {
                self.num_items.fetch_add(1, Ordering::Relaxed);
                self.update_collection_count(key.collection(), 1);
            }
            (true, true) => {
                self.num_items.fetch_sub(1, Ordering::Relaxed);
                self.update_collection_count(key.collection(), -1);
            }
            _ => {}
        }
        self.max_visible_seqno
            .fetch_max(item.by_seqno, Ordering::Relaxed);
        self.stats.disk_queue_size.fetch_add(1, Ordering::Relaxed);
    }

    fn update_collection_count(&self, cid: CollectionId, delta: i64) {
        let mut counts = self.collection_counts.lock();
        let entry = counts.entry(cid).or_insert(0);
        if delta >= 0 {
            *entry += delta as u64;
        } else {
            *entry = entry.saturating_sub(delta.unsigned_abs());
        }
    }

    fn expire_document(&self, key: &DocKey, sv: &StoredValue) {
        trace!(vbid = self.id, key = %key, "expiring document");
        let cas = self.hlc.next_cas();
        let rev_seqno = sv.rev_seqno + 1;
        let item = self.checkpoint_mgr.queue(|seqno| QueuedItem {
            key: key.clone(),
            value: Vec::new(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: now_secs(),
            cas,
            by_seqno: seqno,
            rev_seqno,
            op: QueueOp::Expiration,
            committed: CommittedState::CommittedViaMutation,
            durability: None,
            deleted: true,
            prepare_seqno: None,
        });
        self.apply_committed(key, &item, true);
        self.stats.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Compaction found `key` expired on disk; delete it through the normal
    /// write path if the in-memory copy agrees.
    pub fn process_expired_key(&self, key: &DocKey) {
        if let Some(sv) = self.hash_table.get_committed(key) {
            if sv.is_expired(now_secs()) {
                self.expire_document(key, &sv);
            }
        }
    }

    // ------------------------------------------------------------------
    // Durability inputs
    // ------------------------------------------------------------------

    /// A replica acknowledged every prepare up to `seqno`.
    pub fn seqno_acknowledged(&self, node: &str, seqno: Seqno) -> Result<(), EngineError> {
        {
            let mut dm = self.durability.lock();
            let adm = dm.as_active_mut()?;
            adm.seqno_ack(node, seqno);
        }
        self.process_resolved_sync_writes();
        Ok(())
    }

    /// The flusher persisted every item up to `seqno`.
    pub fn notify_persisted_seqno(&self, seqno: Seqno) {
        self.durability.lock().persisted_up_to(seqno);
        self.process_resolved_sync_writes();
    }

    /// Abort any prepare whose deadline has passed.
    pub fn tick_durability(&self, now: Instant) {
        self.durability.lock().tick(now);
        self.process_resolved_sync_writes();
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    /// Transition the vBucket, switching the durability monitor role and
    /// carrying outstanding prepares across. Returns cookie notifications
    /// for the caller to deliver (off the hot path).
    pub fn set_state(
        &self,
        new_state: VBucketStateKind,
        topology: Option<ReplicationTopology>,
    ) -> Result<Vec<(CookieHandle, SyncWriteResult)>, EngineError> {
        let mut notifications = Vec::new();
        {
            let mut state = self.state.write();
            let old_state = *state;
            debug!(vbid = self.id, ?old_state, ?new_state, "vbucket state change");

            let mut dm = self.durability.lock();
            match new_state {
                VBucketStateKind::Active => {
                    let current = std::mem::replace(
                        &mut *dm,
                        DurabilityMonitor::Passive(PassiveDurabilityMonitor::new()),
                    );
                    *dm = current.into_active(topology);
                    if old_state != VBucketStateKind::Active {
                        let mut table = self.failover_table.lock();
                        table.insert(
                            0,
                            FailoverEntry {
                                vb_uuid: rand::thread_rng().gen(),
                                by_seqno: self.high_seqno(),
                            },
                        );
                    }
                }
                VBucketStateKind::Replica | VBucketStateKind::Pending => {
                    let current = std::mem::replace(
                        &mut *dm,
                        DurabilityMonitor::Passive(PassiveDurabilityMonitor::new()),
                    );
                    let (pdm, notes) = current.into_passive();
                    *dm = pdm;
                    notifications.extend(notes);
                }
                VBucketStateKind::Dead => {
                    for resolved in dm.abort_all_for_state_change() {
                        if let Some(cookie) = resolved.cookie {
                            notifications.push((cookie, SyncWriteResult::Ambiguous));
                        }
                    }
                }
            }
            *state = new_state;
        }
        // Record the transition in the mutation stream so the new state is
        // persisted with the next flush.
        self.checkpoint_mgr.queue_set_vbucket_state();
        // A takeover with topology may have released commits.
        self.process_resolved_sync_writes();
        self.stats
            .sync_writes_ambiguous
            .fetch_add(notifications.len() as u64, Ordering::Relaxed);
        Ok(notifications)
    }

    // ------------------------------------------------------------------
    // Replication input (passive side)
    // ------------------------------------------------------------------

    /// A snapshot marker opens a new checkpoint with the marker's range.
    pub fn receive_snapshot_marker(
        &self,
        snap_start: Seqno,
        snap_end: Seqno,
        disk: bool,
    ) -> Result<(), EngineError> {
        let state = self.state.read();
        if !state.takes_replica_traffic() {
            return Err(EngineError::NotMyVBucket);
        }
        let ckpt_type = if disk {
            CheckpointType::Disk
        } else {
            CheckpointType::Memory
        };
        self.checkpoint_mgr
            .create_snapshot_checkpoint(snap_start, snap_end, ckpt_type);
        *self.replica_snapshot.lock() = Some((snap_start, snap_end));
        Ok(())
    }

    /// Apply a committed mutation or deletion from the stream.
    pub fn receive_mutation(&self, incoming: ReplicaItem) -> Result<(), EngineError> {
        let state = self.state.read();
        if !state.takes_replica_traffic() {
            return Err(EngineError::NotMyVBucket);
        }
        let was_alive = self
            .hash_table
            .get_committed(&incoming.key)
            .is_some_and(|sv| sv.is_alive());
        self.hlc.note_remote_cas(incoming.cas);
        if incoming.datatype.has_xattr() {
            self.might_contain_xattrs.store(true, Ordering::Relaxed);
        }
        let key = incoming.key.clone();
        let seqno = incoming.by_seqno;
        let item = self.checkpoint_mgr.queue_replica(QueuedItem {
            op: if incoming.deleted {
                QueueOp::Deletion
            } else {
                QueueOp::Mutation
            },
            committed: CommittedState::CommittedViaMutation,
            key: incoming.key,
            value: incoming.value,
            datatype: incoming.datatype,
            flags: incoming.flags,
            expiry: incoming.expiry,
            cas: incoming.cas,
            by_seqno: incoming.by_seqno,
            rev_seqno: incoming.rev_seqno,
            durability: None,
            deleted: incoming.deleted,
            prepare_seqno: None,
        })?;
        self.apply_committed(&key, &item, was_alive);
        self.note_replica_seqno(seqno);
        Ok(())
    }

    /// Apply a prepare from the stream; tracked by the passive monitor.
    pub fn receive_prepare(&self, incoming: ReplicaItem) -> Result<(), EngineError> {
        let state = self.state.read();
        if !state.takes_replica_traffic() {
            return Err(EngineError::NotMyVBucket);
        }
        let durability = incoming
            .durability
            .ok_or(EngineError::InvalidArguments)?;
        self.hlc.note_remote_cas(incoming.cas);
        let key = incoming.key.clone();
        let seqno = incoming.by_seqno;
        let item = self.checkpoint_mgr.queue_replica(QueuedItem {
            op: QueueOp::PendingSyncWrite,
            committed: CommittedState::Pending,
            key: incoming.key,
            value: incoming.value,
            datatype: incoming.datatype,
            flags: incoming.flags,
            expiry: incoming.expiry,
            cas: incoming.cas,
            by_seqno: incoming.by_seqno,
            rev_seqno: incoming.rev_seqno,
            durability: Some(durability),
            deleted: incoming.deleted,
            prepare_seqno: None,
        })?;
        self.hash_table
            .set_prepared(&key, StoredValue::from_item(&item));
        self.stats.disk_queue_size.fetch_add(1, Ordering::Relaxed);
        {
            let mut dm = self.durability.lock();
            let pdm = dm.as_passive_mut()?;
            pdm.track_received_prepare(item);
        }
        self.note_replica_seqno(seqno);
        Ok(())
    }

    /// Apply a commit from the stream.
    pub fn receive_commit(
        &self,
        key: &DocKey,
        prepare_seqno: Seqno,
        commit_seqno: Seqno,
    ) -> Result<(), EngineError> {
        let state = self.state.read();
        if !state.takes_replica_traffic() {
            return Err(EngineError::NotMyVBucket);
        }
        {
            let mut dm = self.durability.lock();
            let pdm = dm.as_passive_mut()?;
            pdm.complete_sync_write(key, prepare_seqno, Resolution::Commit)?;
        }
        self.complete_commit(key, prepare_seqno, Some(commit_seqno))?;
        self.note_replica_seqno(commit_seqno);
        Ok(())
    }

    /// Apply an abort from the stream.
    pub fn receive_abort(
        &self,
        key: &DocKey,
        prepare_seqno: Seqno,
        abort_seqno: Seqno,
    ) -> Result<(), EngineError> {
        let state = self.state.read();
        if !state.takes_replica_traffic() {
            return Err(EngineError::NotMyVBucket);
        }
        {
            let mut dm = self.durability.lock();
            let pdm = dm.as_passive_mut()?;
            pdm.complete_sync_write(
                key,
                prepare_seqno,
                Resolution::Abort(crate::durability::AbortReason::StateChange),
            )?;
        }
        self.complete_abort(key, prepare_seqno, Some(abort_seqno))?;
        self.note_replica_seqno(abort_seqno);
        Ok(())
    }

    fn note_replica_seqno(&self, seqno: Seqno) {
        let snapshot = *self.replica_snapshot.lock();
        if let Some((_, end)) = snapshot {
            if seqno >= end {
                let mut dm = self.durability.lock();
                if let Ok(pdm) = dm.as_passive_mut() {
                    pdm.notify_snapshot_end(end);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence support
    // ------------------------------------------------------------------

    /// Build the vbucket_state document for a flush ending at `high_seqno`
    /// of checkpoint `checkpoint_id`.
    pub fn build_vbstate(&self, checkpoint_id: u64, high_seqno: Seqno) -> PersistedVBState {
        let (topology, hps, hcs) = {
            let dm = self.durability.lock();
            let topology = match &*dm {
                DurabilityMonitor::Active(adm) => adm.topology().cloned(),
                DurabilityMonitor::Passive(_) => None,
            };
            (topology, dm.high_prepared_seqno(), dm.high_completed_seqno())
        };
        PersistedVBState {
            state: self.state(),
            topology,
            high_seqno,
            high_prepared_seqno: hps.min(high_seqno),
            high_completed_seqno: hcs.min(high_seqno),
            max_cas: self.hlc.max_cas(),
            failover_table: self.failover_table.lock().clone(),
            purge_seqno: self.purge_seqno.load(Ordering::Relaxed),
            max_visible_seqno: self
                .max_visible_seqno
                .load(Ordering::Relaxed)
                .min(high_seqno),
            checkpoint_id,
            might_contain_xattrs: self.might_contain_xattrs.load(Ordering::Relaxed),
            hlc_epoch_seqno: 0,
        }
    }

    /// Flusher bookkeeping after a successful commit.
    pub fn on_flush_success(
        &self,
        num_flushed: usize,
        committed_inserts: usize,
        committed_deletes: usize,
        persisted_high_seqno: Seqno,
    ) {
        self.on_disk_items
            .fetch_add(committed_inserts as u64, Ordering::Relaxed);
        let deletes = committed_deletes as u64;
        let mut current = self.on_disk_items.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(deletes);
            match self.on_disk_items.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        EngineStats::sub(&self.stats.disk_queue_size, num_flushed as u64);
        self.notify_persisted_seqno(persisted_high_seqno);
    }

    /// Raise the purge seqno after compaction dropped records below it.
    pub fn note_purge_seqno(&self, seqno: Seqno) {
        self.purge_seqno.fetch_max(seqno, Ordering::Relaxed);
    }

    /// Reset in-memory state after a KVStore rollback, reloading committed
    /// documents from the post-rollback scan.
    pub fn reset_after_rollback(
        &self,
        rollback_seqno: Seqno,
        reloaded: Vec<(DocKey, StoredValue)>,
    ) {
        self.hash_table.clear();
        self.collection_counts.lock().clear();
        let mut alive = 0u64;
        for (key, sv) in reloaded {
            if sv.is_alive() && sv.committed.is_committed() {
                alive += 1;
                self.update_collection_count(key.collection(), 1);
            }
            self.hash_table.set_committed(&key, sv);
        }
        self.num_items.store(alive, Ordering::Relaxed);
        self.on_disk_items.store(alive, Ordering::Relaxed);
        self.max_visible_seqno
            .store(rollback_seqno, Ordering::Relaxed);
        self.checkpoint_mgr.reset(rollback_seqno);
        let mut dm = self.durability.lock();
        *dm = match self.state() {
            VBucketStateKind::Active => DurabilityMonitor::Active(
                crate::durability::ActiveDurabilityMonitor::new(None),
            ),
            _ => DurabilityMonitor::Passive(PassiveDurabilityMonitor::new()),
        };
    }
}

/// Current wall-clock in whole seconds.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
