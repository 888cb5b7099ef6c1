//! Bucket types: the public face of the engine.
//!
//! A [`Bucket`] owns vBuckets and routes operations to them. Two concrete
//! implementations exist: [`EpBucket`] persists through a [`KVStore`] with a
//! full background-task complement, and [`EphemeralBucket`] keeps everything
//! in memory (and consequently refuses persistence-dependent durability
//! levels at the vBucket layer).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointDestroyer, CheckpointManager, CheckpointRemover, ReclamationOutcome};
use crate::durability::{CookieHandle, SyncWriteResult};
use crate::executor::{RuntimeContext, TaskWaker};
use crate::flusher::{FlushResult, Flusher};
use crate::item::{DocKey, Seqno};
use crate::kvstore::{
    CompactionCallbacks, CompactionConfig, CompactionResult, DiskDocKey, KVStore, RollbackResult,
    Vbid,
};
use crate::hash_table::StoredValue;
use crate::status::EngineError;
use crate::topology::ReplicationTopology;
use crate::vbucket::{
    now_secs, GetResult, MutationResult, VBucket, VBucketStateKind, WriteOptions,
};

/// Operations common to every bucket type.
pub trait Bucket: Send + Sync + 'static {
    /// The runtime wiring this bucket was built with.
    fn runtime(&self) -> &RuntimeContext;

    /// Look up a vBucket; absent vBuckets report [`EngineError::NotMyVBucket`].
    fn get_vbucket(&self, vbid: Vbid) -> Result<Arc<VBucket>, EngineError>;

    /// Create or transition a vBucket.
    fn set_vbucket_state(
        &self,
        vbid: Vbid,
        state: VBucketStateKind,
        topology: Option<ReplicationTopology>,
    ) -> Result<(), EngineError>;

    /// Upsert.
    fn set(
        &self,
        vbid: Vbid,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.get_vbucket(vbid)?.set(key, value, opts, cookie)
    }

    /// Insert.
    fn add(
        &self,
        vbid: Vbid,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.get_vbucket(vbid)?.add(key, value, opts, cookie)
    }

    /// Update.
    fn replace(
        &self,
        vbid: Vbid,
        key: &DocKey,
        value: Vec<u8>,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.get_vbucket(vbid)?.replace(key, value, opts, cookie)
    }

    /// Delete.
    fn delete(
        &self,
        vbid: Vbid,
        key: &DocKey,
        opts: WriteOptions,
        cookie: Option<CookieHandle>,
    ) -> Result<MutationResult, EngineError> {
        self.get_vbucket(vbid)?.delete(key, opts, cookie)
    }

    /// Point read.
    fn get(&self, vbid: Vbid, key: &DocKey) -> Result<GetResult, EngineError> {
        self.get_vbucket(vbid)?.get(key)
    }

    /// Commit an outstanding prepare.
    fn commit(
        &self,
        vbid: Vbid,
        key: &DocKey,
        prepare_seqno: Seqno,
    ) -> Result<MutationResult, EngineError> {
        self.get_vbucket(vbid)?.commit(key, prepare_seqno)
    }

    /// Abort an outstanding prepare.
    fn abort(
        &self,
        vbid: Vbid,
        key: &DocKey,
        prepare_seqno: Seqno,
    ) -> Result<MutationResult, EngineError> {
        self.get_vbucket(vbid)?.abort(key, prepare_seqno)
    }

    /// Record a replica's seqno acknowledgement.
    fn seqno_acknowledged(
        &self,
        vbid: Vbid,
        node: &str,
        seqno: Seqno,
    ) -> Result<(), EngineError> {
        self.get_vbucket(vbid)?.seqno_acknowledged(node, seqno)
    }
}

/// vBucket registry shared by the bucket implementations.
struct BucketCore {
    ctx: RuntimeContext,
    vbuckets: RwLock<HashMap<Vbid, Arc<VBucket>>>,
    ephemeral: bool,
}

impl BucketCore {
    fn new(ctx: RuntimeContext, ephemeral: bool) -> Self {
        Self {
            ctx,
            vbuckets: RwLock::new(HashMap::new()),
            ephemeral,
        }
    }

    fn get(&self, vbid: Vbid) -> Result<Arc<VBucket>, EngineError> {
        self.vbuckets
            .read()
            .get(&vbid)
            .cloned()
            .ok_or(EngineError::NotMyVBucket)
    }

    fn all(&self) -> Vec<Arc<VBucket>> {
        self.vbuckets.read().values().cloned().collect()
    }

    /// Create-or-transition; returns the cookie notifications to deliver.
    fn set_state(
        &self,
        vbid: Vbid,
        state: VBucketStateKind,
        topology: Option<ReplicationTopology>,
    ) -> Result<Vec<(CookieHandle, SyncWriteResult)>, EngineError> {
        let existing = self.vbuckets.read().get(&vbid).cloned();
        match existing {
            Some(vb) => vb.set_state(state, topology),
            None => {
                // New vBuckets start Pending so the transition below runs
                // the full role-switch path (failover entry on promotion to
                // Active included).
                let vb = Arc::new(VBucket::new(
                    vbid,
                    VBucketStateKind::Pending,
                    &self.ctx.config,
                    self.ctx.stats.clone(),
                    self.ephemeral,
                ));
                let notifications = vb.set_state(state, topology)?;
                self.vbuckets.write().insert(vbid, vb);
                info!(vbid, ?state, "created vbucket");
                Ok(notifications)
            }
        }
    }

    /// Deliver state-change notifications off the caller's thread, the way
    /// the connection layer would.
    fn deliver_notifications(&self, notifications: Vec<(CookieHandle, SyncWriteResult)>) {
        if notifications.is_empty() {
            return;
        }
        self.ctx
            .executor
            .spawn_once("respond-ambiguous", move || {
                for (cookie, result) in notifications {
                    cookie.notify(result);
                }
            });
    }
}

/// Persistent bucket: vBuckets, flusher shards, and reclamation tasks over
/// a [`KVStore`].
pub struct EpBucket {
    core: BucketCore,
    kvstore: Arc<dyn KVStore>,
    flusher: Flusher,
    destroyer: Arc<CheckpointDestroyer>,
    remover: CheckpointRemover,
    flusher_wakers: Mutex<Vec<TaskWaker>>,
    destroyer_waker: Mutex<Option<TaskWaker>>,
    remover_waker: Mutex<Option<TaskWaker>>,
}

impl EpBucket {
    /// Build a persistent bucket over `kvstore`. Background tasks are not
    /// started until [`Self::start_background_tasks`].
    pub fn new(ctx: RuntimeContext, kvstore: Arc<dyn KVStore>) -> Arc<Self> {
        let destroyer = Arc::new(CheckpointDestroyer::new(ctx.stats.clone()));
        let flusher = Flusher::new(
            kvstore.clone(),
            destroyer.clone(),
            ctx.stats.clone(),
            ctx.config.flusher_batch_split_trigger,
        );
        let remover = CheckpointRemover::new(ctx.config.checkpoint_memory_quota, ctx.stats.clone());
        Arc::new(Self {
            core: BucketCore::new(ctx, false),
            kvstore,
            flusher,
            destroyer,
            remover,
            flusher_wakers: Mutex::new(Vec::new()),
            destroyer_waker: Mutex::new(None),
            remover_waker: Mutex::new(None),
        })
    }

    /// The store this bucket persists through.
    pub fn kvstore(&self) -> &Arc<dyn KVStore> {
        &self.kvstore
    }

    /// Spawn the flusher shards, checkpoint remover, destroyer, and
    /// durability timeout task.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let config = &self.core.ctx.config;
        let executor = self.core.ctx.executor.clone();

        for shard in 0..config.num_shards {
            let bucket = Arc::clone(self);
            let num_shards = config.num_shards;
            let waker = executor.spawn_periodic(
                &format!("flusher:{shard}"),
                Duration::from_millis(50),
                move || bucket.flush_shard(shard, num_shards),
            );
            self.flusher_wakers.lock().push(waker);
        }

        let bucket = Arc::clone(self);
        let remover_waker = executor.spawn_periodic(
            "checkpoint-remover",
            Duration::from_millis(config.remover_interval_ms),
            move || {
                bucket.run_checkpoint_remover();
            },
        );
        *self.remover_waker.lock() = Some(remover_waker);

        let bucket = Arc::clone(self);
        let destroyer_waker = executor.spawn_on_demand("checkpoint-destroyer", move || {
            bucket.run_destroyer();
        });
        *self.destroyer_waker.lock() = Some(destroyer_waker);

        let bucket = Arc::clone(self);
        executor.spawn_periodic(
            "durability-timeout",
            Duration::from_millis(config.durability_timeout_task_interval_ms),
            move || {
                let now = std::time::Instant::now();
                for vb in bucket.core.all() {
                    vb.tick_durability(now);
                }
            },
        );
    }

    fn flush_shard(&self, shard: usize, num_shards: usize) {
        let mut backoff = Duration::from_millis(self.core.ctx.config.flusher_backoff_base_ms);
        let backoff_max = Duration::from_millis(self.core.ctx.config.flusher_backoff_max_ms);
        for vb in self.core.all() {
            if (vb.id() as usize) % num_shards != shard {
                continue;
            }
            loop {
                match self.flusher.flush_vbucket(&vb) {
                    Ok(result) => {
                        backoff =
                            Duration::from_millis(self.core.ctx.config.flusher_backoff_base_ms);
                        if result.wake_checkpoint_remover {
                            self.wake_checkpoint_remover();
                        }
                        if !result.more_available {
                            break;
                        }
                    }
                    Err(err) => {
                        // Flush failures are invisible to clients: the
                        // cursor has not moved, so the same batch retries
                        // after a backoff that doubles per failure.
                        warn!(vbid = vb.id(), %err, backoff_ms = backoff.as_millis() as u64, "flush retry");
                        std::thread::sleep(backoff);
                        backoff = (backoff * 2).min(backoff_max);
                        break;
                    }
                }
            }
        }
    }

    /// Flush one vBucket's pending items once.
    pub fn flush_vbucket(&self, vbid: Vbid) -> Result<FlushResult, EngineError> {
        let vb = self.core.get(vbid)?;
        self.flusher
            .flush_vbucket(&vb)
            .map_err(|_| EngineError::TemporaryFailure)
    }

    /// Flush one vBucket until nothing remains. Returns total items flushed.
    pub fn flush_vbucket_to_empty(&self, vbid: Vbid) -> Result<usize, EngineError> {
        let mut total = 0;
        loop {
            let result = self.flush_vbucket(vbid)?;
            total += result.num_flushed;
            if !result.more_available {
                return Ok(total);
            }
        }
    }

    /// Wake every flusher shard.
    pub fn wake_flushers(&self) {
        for waker in self.flusher_wakers.lock().iter() {
            waker.wake();
        }
    }

    /// Wake the checkpoint remover.
    pub fn wake_checkpoint_remover(&self) {
        if let Some(waker) = self.remover_waker.lock().as_ref() {
            waker.wake();
        }
    }

    /// Run one reclamation pass inline.
    pub fn run_checkpoint_remover(&self) -> ReclamationOutcome {
        let managers: Vec<(Vbid, Arc<CheckpointManager>)> = self
            .core
            .all()
            .iter()
            .map(|vb| (vb.id(), vb.checkpoint_manager().clone()))
            .collect();
        let outcome = self.remover.run(&managers, &self.destroyer);
        if outcome.total() > 0 {
            if let Some(waker) = self.destroyer_waker.lock().as_ref() {
                waker.wake();
            }
        }
        outcome
    }

    /// Free detached checkpoints inline. Returns bytes released.
    pub fn run_destroyer(&self) -> usize {
        self.destroyer.run()
    }

    /// The destroyer owning detached checkpoints.
    pub fn destroyer(&self) -> &Arc<CheckpointDestroyer> {
        &self.destroyer
    }

    /// Compact one vBucket: purge completed prepares below the persisted
    /// high-completed-seqno and feed expired documents back through the
    /// deletion path.
    pub fn compact_vbucket(&self, vbid: Vbid) -> Result<CompactionResult, EngineError> {
        let vb = self.core.get(vbid)?;
        let vbstate = self
            .kvstore
            .get_vbucket_state(vbid)
            .map_err(|_| EngineError::TemporaryFailure)?;
        let config = CompactionConfig {
            now_secs: now_secs(),
            drop_prepares_below: vbstate.map(|s| s.high_completed_seqno).unwrap_or(0),
            purge_tombstones_before: 0,
        };
        let mut max_dropped: Seqno = 0;
        let mut expired_keys: Vec<DocKey> = Vec::new();
        let result = {
            let mut expiry = |key: &DiskDocKey, _doc: &crate::kvstore::DiskDoc| {
                expired_keys.push(key.doc_key().clone());
            };
            let mut drop_key = |_key: &DiskDocKey, seqno: Seqno, _is_abort: bool| {
                max_dropped = max_dropped.max(seqno);
            };
            self.kvstore
                .compact(
                    vbid,
                    &config,
                    &mut CompactionCallbacks {
                        expiry: &mut expiry,
                        drop_key: &mut drop_key,
                    },
                )
                .map_err(|_| EngineError::TemporaryFailure)?
        };
        for key in expired_keys {
            vb.process_expired_key(&key);
        }
        if max_dropped > 0 {
            vb.note_purge_seqno(max_dropped);
        }
        debug!(vbid, ?result, "compaction complete");
        Ok(result)
    }

    /// Roll a non-active vBucket back to `target_seqno`, reloading its
    /// in-memory state from the post-rollback store.
    pub fn rollback_vbucket(
        &self,
        vbid: Vbid,
        target_seqno: Seqno,
    ) -> Result<RollbackResult, EngineError> {
        let vb = self.core.get(vbid)?;
        if vb.state() == VBucketStateKind::Active {
            return Err(EngineError::InvalidArguments);
        }
        let result = self
            .kvstore
            .rollback(vbid, target_seqno)
            .map_err(|_| EngineError::TemporaryFailure)?;
        let reloaded = self
            .kvstore
            .scan_by_seqno(vbid, 1, result.rollback_seqno)
            .map_err(|_| EngineError::TemporaryFailure)?
            .into_iter()
            .filter(|item| !item.key.is_prepared())
            .map(|item| {
                let sv = StoredValue {
                    value: item.doc.value,
                    datatype: item.doc.datatype,
                    flags: item.doc.flags,
                    expiry: item.doc.expiry,
                    cas: item.doc.cas,
                    by_seqno: item.doc.by_seqno,
                    rev_seqno: item.doc.rev_seqno,
                    deleted: item.doc.deleted,
                    committed: item.doc.committed,
                    durability: None,
                };
                (item.key.doc_key().clone(), sv)
            })
            .collect();
        vb.reset_after_rollback(result.rollback_seqno, reloaded);
        info!(vbid, target_seqno, rolled_back_to = result.rollback_seqno, "rollback complete");
        Ok(result)
    }
}

impl Bucket for EpBucket {
    fn runtime(&self) -> &RuntimeContext {
        &self.core.ctx
    }

    fn get_vbucket(&self, vbid: Vbid) -> Result<Arc<VBucket>, EngineError> {
        self.core.get(vbid)
    }

    fn set_vbucket_state(
        &self,
        vbid: Vbid,
        state: VBucketStateKind,
        topology: Option<ReplicationTopology>,
    ) -> Result<(), EngineError> {
        let notifications = self.core.set_state(vbid, state, topology)?;
        self.core.deliver_notifications(notifications);
        self.wake_flushers();
        Ok(())
    }
}

/// In-memory bucket: no KVStore, no flusher. SyncWrites at persistence
/// levels are refused with [`EngineError::DurabilityInvalidLevel`].
pub struct EphemeralBucket {
    core: BucketCore,
}

impl EphemeralBucket {
    /// Build an ephemeral bucket.
    pub fn new(ctx: RuntimeContext) -> Arc<Self> {
        Arc::new(Self {
            core: BucketCore::new(ctx, true),
        })
    }
}

impl Bucket for EphemeralBucket {
    fn runtime(&self) -> &RuntimeContext {
        &self.core.ctx
    }

    fn get_vbucket(&self, vbid: Vbid) -> Result<Arc<VBucket>, EngineError> {
        self.core.get(vbid)
    }

    fn set_vbucket_state(
        &self,
        vbid: Vbid,
        state: VBucketStateKind,
        topology: Option<ReplicationTopology>,
    ) -> Result<(), EngineError> {
        let notifications = self.core.set_state(vbid, state, topology)?;
        self.core.deliver_notifications(notifications);
        Ok(())
    }
}
