//! Shared test fixtures for the integration suite.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ebbstore::item::Seqno;
use ebbstore::kvstore::{
    CommitOutcome, CompactionCallbacks, CompactionConfig, CompactionResult, DiskDoc, DiskDocKey,
    FlushBatch, KVStore, KVStoreError, MemoryKvStore, PersistedVBState, RollbackResult, ScanItem,
    Vbid,
};

/// A fault-injection wrapper around any `KVStore`.
///
/// Allows deterministic injection of commit failures: the Nth commit
/// (1-based) returns an I/O error without applying the batch, exactly like a
/// failed disk write under an atomic commit protocol.
pub struct FaultInjectionKvStore<S> {
    inner: S,
    /// Total commit calls observed so far.
    commit_count: AtomicU64,
    /// When non-zero, the Nth commit (1-based) fails.
    fail_commit_at: AtomicU64,
    /// When non-zero, every commit fails until this many have been refused.
    fail_commits_remaining: AtomicU64,
}

impl<S: KVStore> FaultInjectionKvStore<S> {
    /// Wrap an existing store for fault injection.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            commit_count: AtomicU64::new(0),
            fail_commit_at: AtomicU64::new(0),
            fail_commits_remaining: AtomicU64::new(0),
        }
    }

    /// Make the Nth commit (1-based) return an I/O error.
    pub fn inject_commit_error_at(&self, operation_n: u64) {
        self.fail_commit_at.store(operation_n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail.
    pub fn inject_commit_errors(&self, n: u64) {
        self.fail_commits_remaining.store(n, Ordering::SeqCst);
    }

    /// Total commits observed (including refused ones).
    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: KVStore> KVStore for FaultInjectionKvStore<S> {
    fn put(&self, vbid: Vbid, key: &DiskDocKey, doc: DiskDoc) -> Result<(), KVStoreError> {
        self.inner.put(vbid, key, doc)
    }

    fn get(&self, vbid: Vbid, key: &DiskDocKey) -> Result<Option<DiskDoc>, KVStoreError> {
        self.inner.get(vbid, key)
    }

    fn delete(&self, vbid: Vbid, key: &DiskDocKey) -> Result<(), KVStoreError> {
        self.inner.delete(vbid, key)
    }

    fn commit(
        &self,
        vbid: Vbid,
        batch: &FlushBatch,
        vbstate: &PersistedVBState,
    ) -> Result<CommitOutcome, KVStoreError> {
        let n = self.commit_count.fetch_add(1, Ordering::SeqCst) + 1;

        let target = self.fail_commit_at.load(Ordering::SeqCst);
        if target != 0 && n == target {
            return Err(KVStoreError::Io(format!(
                "injected commit error at operation {n}"
            )));
        }
        let remaining = self.fail_commits_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_commits_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(KVStoreError::Io("injected commit error".to_string()));
        }
        self.inner.commit(vbid, batch, vbstate)
    }

    fn get_vbucket_state(&self, vbid: Vbid) -> Result<Option<PersistedVBState>, KVStoreError> {
        self.inner.get_vbucket_state(vbid)
    }

    fn scan_by_seqno(
        &self,
        vbid: Vbid,
        low: Seqno,
        high: Seqno,
    ) -> Result<Vec<ScanItem>, KVStoreError> {
        self.inner.scan_by_seqno(vbid, low, high)
    }

    fn compact(
        &self,
        vbid: Vbid,
        config: &CompactionConfig,
        callbacks: &mut CompactionCallbacks<'_>,
    ) -> Result<CompactionResult, KVStoreError> {
        self.inner.compact(vbid, config, callbacks)
    }

    fn rollback(&self, vbid: Vbid, target_seqno: Seqno) -> Result<RollbackResult, KVStoreError> {
        self.inner.rollback(vbid, target_seqno)
    }

    fn delete_vbucket(&self, vbid: Vbid) -> Result<(), KVStoreError> {
        self.inner.delete_vbucket(vbid)
    }
}

/// A fault-injection store over a fresh in-memory store.
pub fn faulty_memory_store() -> Arc<FaultInjectionKvStore<MemoryKvStore>> {
    Arc::new(FaultInjectionKvStore::new(MemoryKvStore::new()))
}
