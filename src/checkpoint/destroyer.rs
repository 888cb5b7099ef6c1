//! Deferred destruction of detached checkpoints.
//!
//! Unlinking a checkpoint from its manager happens under the manager lock;
//! freeing a large item list there would stall the write path. Detached
//! checkpoints are handed to the destroyer instead, which swaps the pending
//! list out under its own lock and drops it outside.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::checkpoint::Checkpoint;
use crate::stats::EngineStats;

/// Collector of detached checkpoints awaiting destruction.
#[derive(Debug)]
pub struct CheckpointDestroyer {
    to_destroy: Mutex<Vec<Checkpoint>>,
    stats: Arc<EngineStats>,
}

impl CheckpointDestroyer {
    /// New, empty destroyer.
    pub fn new(stats: Arc<EngineStats>) -> Self {
        Self {
            to_destroy: Mutex::new(Vec::new()),
            stats,
        }
    }

    /// Queue detached checkpoints for destruction, charging their memory to
    /// the pending-destruction counter.
    pub fn queue_for_destruction(&self, checkpoints: Vec<Checkpoint>) {
        if checkpoints.is_empty() {
            return;
        }
        let mem: usize = checkpoints.iter().map(|c| c.mem_usage()).sum();
        self.stats
            .pending_destruction_mem
            .fetch_add(mem, Ordering::Relaxed);
        self.to_destroy.lock().extend(checkpoints);
    }

    /// Free everything queued so far. Holds the lock only for the swap.
    /// Returns the estimated bytes released.
    pub fn run(&self) -> usize {
        let batch = {
            let mut guard = self.to_destroy.lock();
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return 0;
        }
        let mem: usize = batch.iter().map(|c| c.mem_usage()).sum();
        let count = batch.len();
        drop(batch);
        self.stats
            .pending_destruction_mem
            .fetch_sub(mem, Ordering::Relaxed);
        trace!(count, mem, "destroyed detached checkpoints");
        mem
    }

    /// Bytes held by checkpoints queued but not yet destroyed.
    pub fn pending_memory(&self) -> usize {
        self.stats.pending_destruction_mem.load(Ordering::Relaxed)
    }
}
