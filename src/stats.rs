//! Engine-wide counters.
//!
//! All counters are relaxed atomics: they feed stats output and reclamation
//! heuristics, never correctness decisions.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter set for one bucket.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Items queued for persistence and not yet flushed.
    pub disk_queue_size: AtomicU64,
    /// Successful flusher commits.
    pub flusher_commits: AtomicU64,
    /// Failed flusher commits (each is retried).
    pub flusher_commit_failures: AtomicU64,
    /// Total items written to the KVStore.
    pub items_flushed: AtomicU64,
    /// SyncWrites committed.
    pub sync_writes_committed: AtomicU64,
    /// SyncWrites aborted (explicitly or by timeout).
    pub sync_writes_aborted: AtomicU64,
    /// Cookies notified with an ambiguous outcome.
    pub sync_writes_ambiguous: AtomicU64,
    /// Closed checkpoints removed.
    pub checkpoints_removed: AtomicU64,
    /// Items expelled from referenced checkpoints.
    pub items_expelled: AtomicU64,
    /// Bytes recovered by expelling.
    pub mem_freed_by_expel: AtomicU64,
    /// Replication cursors dropped under memory pressure.
    pub cursors_dropped: AtomicU64,
    /// Bytes held by checkpoints detached but not yet destroyed.
    pub pending_destruction_mem: AtomicUsize,
    /// Documents expired on the read path or by compaction.
    pub expirations: AtomicU64,
}

impl EngineStats {
    /// Fresh counter set, all zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add `n` to a counter.
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtract `n`, saturating at zero.
    #[inline]
    pub fn sub(counter: &AtomicU64, n: u64) {
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Read a counter.
    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
