//! Memory-pressure-driven checkpoint reclamation.
//!
//! When checkpoint memory exceeds its quota the remover works through an
//! escalation ladder, visiting vBuckets in descending checkpoint-memory
//! order and stopping as soon as enough has been recovered:
//!
//! 1. remove closed unreferenced checkpoints;
//! 2. expel items below every cursor;
//! 3. drop slow replication cursors (kicking their streams back to
//!    backfill), then remove again.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::checkpoint::{CheckpointDestroyer, CheckpointManager};
use crate::stats::EngineStats;

/// What one remover pass recovered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclamationOutcome {
    /// Bytes recovered by removing closed unreferenced checkpoints.
    pub removed_memory: usize,
    /// Bytes recovered by expelling items.
    pub expelled_memory: usize,
    /// Replication cursors dropped; their streams must backfill from disk.
    pub dropped_cursors: Vec<String>,
}

impl ReclamationOutcome {
    /// Total bytes recovered.
    pub fn total(&self) -> usize {
        self.removed_memory + self.expelled_memory
    }
}

/// The reclamation pass, run periodically or on demand.
#[derive(Debug)]
pub struct CheckpointRemover {
    memory_quota: usize,
    stats: Arc<EngineStats>,
}

impl CheckpointRemover {
    /// Remover enforcing `memory_quota` bytes across all checkpoints.
    pub fn new(memory_quota: usize, stats: Arc<EngineStats>) -> Self {
        Self {
            memory_quota,
            stats,
        }
    }

    /// Bytes that must be recovered to get back under quota, given the
    /// current usage of `managers` plus pending-destruction memory.
    pub fn required_memory_reduction(&self, managers: &[(u16, Arc<CheckpointManager>)]) -> usize {
        let usage: usize = managers.iter().map(|(_, cm)| cm.memory_usage()).sum::<usize>()
            + self.stats.pending_destruction_mem.load(Ordering::Relaxed);
        usage.saturating_sub(self.memory_quota)
    }

    /// Run one reclamation pass over the given vBuckets' managers.
    pub fn run(
        &self,
        managers: &[(u16, Arc<CheckpointManager>)],
        destroyer: &CheckpointDestroyer,
    ) -> ReclamationOutcome {
        let mut outcome = ReclamationOutcome::default();
        let to_clear = self.required_memory_reduction(managers);
        if to_clear == 0 {
            return outcome;
        }

        let mut by_memory: Vec<&(u16, Arc<CheckpointManager>)> = managers.iter().collect();
        by_memory.sort_by_key(|(_, cm)| std::cmp::Reverse(cm.memory_usage()));

        // Phase 1: closed-checkpoint removal.
        for (_, cm) in &by_memory {
            if outcome.total() >= to_clear {
                break;
            }
            let removal = cm.remove_closed_unref_checkpoints();
            self.stats
                .checkpoints_removed
                .fetch_add(removal.detached.len() as u64, Ordering::Relaxed);
            outcome.removed_memory += removal.memory;
            destroyer.queue_for_destruction(removal.detached);
        }
        if outcome.total() >= to_clear {
            return outcome;
        }

        // Phase 2: item expelling; preferred over cursor dropping as a
        // dropped cursor forces its stream back to backfill.
        for (vbid, cm) in &by_memory {
            if outcome.total() >= to_clear {
                break;
            }
            let expel = cm.expel_unreferenced_items();
            if expel.count > 0 {
                debug!(
                    vbid,
                    count = expel.count,
                    memory = expel.memory,
                    "expelled checkpoint items"
                );
            }
            self.stats
                .items_expelled
                .fetch_add(expel.count as u64, Ordering::Relaxed);
            self.stats
                .mem_freed_by_expel
                .fetch_add(expel.memory as u64, Ordering::Relaxed);
            outcome.expelled_memory += expel.memory;
        }
        if outcome.total() >= to_clear {
            return outcome;
        }

        // Phase 3: drop slow replication cursors, then retry removal.
        for (_, cm) in &by_memory {
            if outcome.total() >= to_clear {
                break;
            }
            while let Some(name) = cm.drop_slowest_replication_cursor() {
                self.stats.cursors_dropped.fetch_add(1, Ordering::Relaxed);
                outcome.dropped_cursors.push(name);
                let removal = cm.remove_closed_unref_checkpoints();
                self.stats
                    .checkpoints_removed
                    .fetch_add(removal.detached.len() as u64, Ordering::Relaxed);
                outcome.removed_memory += removal.memory;
                destroyer.queue_for_destruction(removal.detached);
                if outcome.total() >= to_clear {
                    break;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::PERSISTENCE_CURSOR;
    use crate::item::{CommittedState, Datatype, DocKey, QueueOp, QueuedItem};

    fn queue_mutation(cm: &CheckpointManager, key: &str, value: &[u8]) {
        cm.queue(|seqno| QueuedItem {
            key: DocKey::new(key),
            value: value.to_vec(),
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
        });
    }

    fn loaded_manager() -> Arc<CheckpointManager> {
        // Small checkpoints so the list grows; lazy removal so the remover
        // has work to do.
        let cm = Arc::new(CheckpointManager::new(0, 0, 4, false));
        for i in 0..32 {
            queue_mutation(&cm, &format!("key-{i}"), &[0u8; 256]);
        }
        // Persistence has consumed everything, leaving closed checkpoints
        // unreferenced.
        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 1000).unwrap();
        cm.advance_cursor(PERSISTENCE_CURSOR, batch.end).unwrap();
        cm
    }

    #[test]
    fn test_no_work_under_quota() {
        let stats = EngineStats::new();
        let remover = CheckpointRemover::new(usize::MAX, stats.clone());
        let destroyer = CheckpointDestroyer::new(stats);
        let managers = vec![(0u16, loaded_manager())];
        assert_eq!(remover.required_memory_reduction(&managers), 0);
        let outcome = remover.run(&managers, &destroyer);
        assert_eq!(outcome, ReclamationOutcome::default());
    }

    #[test]
    fn test_removal_recovers_memory() {
        let stats = EngineStats::new();
        let remover = CheckpointRemover::new(0, stats.clone());
        let destroyer = CheckpointDestroyer::new(stats.clone());
        let managers = vec![(0u16, loaded_manager())];

        let before = managers[0].1.memory_usage();
        let outcome = remover.run(&managers, &destroyer);
        assert!(outcome.removed_memory > 0);
        assert!(managers[0].1.memory_usage() < before);
        // Detached checkpoints are charged to the destroyer until freed.
        assert_eq!(destroyer.pending_memory(), outcome.removed_memory);
        destroyer.run();
        assert_eq!(destroyer.pending_memory(), 0);
    }

    #[test]
    fn test_slow_cursor_dropped_when_removal_insufficient() {
        let stats = EngineStats::new();
        let remover = CheckpointRemover::new(0, stats.clone());
        let destroyer = CheckpointDestroyer::new(stats.clone());

        let cm = Arc::new(CheckpointManager::new(0, 0, 4, false));
        cm.register_cursor("stream").unwrap();
        for i in 0..32 {
            queue_mutation(&cm, &format!("key-{i}"), &[0u8; 256]);
        }
        let batch = cm.peek_items_for_cursor(PERSISTENCE_CURSOR, 1000).unwrap();
        cm.advance_cursor(PERSISTENCE_CURSOR, batch.end).unwrap();

        // The stalled stream cursor pins every checkpoint; quota 0 forces
        // the full ladder.
        let managers = vec![(0u16, cm)];
        let outcome = remover.run(&managers, &destroyer);
        assert_eq!(outcome.dropped_cursors, vec!["stream".to_string()]);
        assert!(outcome.removed_memory > 0);
        assert_eq!(
            crate::stats::EngineStats::get(&stats.cursors_dropped),
            1
        );
    }
}
