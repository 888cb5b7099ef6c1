//! Durability monitor for the passive (replica) role.

use std::collections::VecDeque;

use tracing::trace;

use crate::durability::{
    ActiveDurabilityMonitor, CookieHandle, Resolution, ResolvedSyncWrite, TransferredWrite,
};
use crate::item::{DocKey, QueuedItemPtr, Seqno};
use crate::status::EngineError;

#[derive(Debug)]
struct PassiveWrite {
    item: QueuedItemPtr,
    locally_persisted: bool,
}

/// Tracks prepares received from the active over the replication stream.
#[derive(Debug)]
pub struct PassiveDurabilityMonitor {
    tracked: VecDeque<PassiveWrite>,
    high_prepared_seqno: Seqno,
    high_completed_seqno: Seqno,
    last_persisted_seqno: Seqno,
}

impl PassiveDurabilityMonitor {
    /// Empty passive monitor.
    pub fn new() -> Self {
        Self {
            tracked: VecDeque::new(),
            high_prepared_seqno: 0,
            high_completed_seqno: 0,
            last_persisted_seqno: 0,
        }
    }

    /// Build from an active monitor on an active→replica transition.
    /// Returns the parked cookies, which the caller must notify ambiguous.
    pub(crate) fn from_active(adm: ActiveDurabilityMonitor) -> (Self, Vec<CookieHandle>) {
        let (writes, cookies, hps, hcs, persisted) = adm.into_parts();
        let pdm = Self {
            tracked: writes
                .into_iter()
                .map(|TransferredWrite { item, locally_persisted }| PassiveWrite {
                    item,
                    locally_persisted,
                })
                .collect(),
            high_prepared_seqno: hps,
            high_completed_seqno: hcs,
            last_persisted_seqno: persisted,
        };
        (pdm, cookies)
    }

    /// Number of outstanding tracked prepares.
    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    /// High-prepared-seqno watermark.
    pub fn high_prepared_seqno(&self) -> Seqno {
        self.high_prepared_seqno
    }

    /// High-completed-seqno watermark.
    pub fn high_completed_seqno(&self) -> Seqno {
        self.high_completed_seqno
    }

    /// Track a prepare received in a snapshot.
    pub fn track_received_prepare(&mut self, item: QueuedItemPtr) {
        trace!(seqno = item.by_seqno, "replica tracking prepare");
        let locally_persisted = self.last_persisted_seqno >= item.by_seqno;
        self.tracked.push_back(PassiveWrite {
            item,
            locally_persisted,
        });
    }

    /// A snapshot boundary arrived: everything prepared within it is now
    /// complete on this node, so the HPS advances to the snapshot end.
    pub fn notify_snapshot_end(&mut self, snap_end: Seqno) {
        if snap_end > self.high_prepared_seqno {
            self.high_prepared_seqno = snap_end;
        }
    }

    /// Record local persistence of every prepare up to `seqno`.
    pub fn persisted_up_to(&mut self, seqno: Seqno) {
        if seqno <= self.last_persisted_seqno {
            return;
        }
        self.last_persisted_seqno = seqno;
        for write in self.tracked.iter_mut() {
            if write.item.by_seqno > seqno {
                break;
            }
            write.locally_persisted = true;
        }
    }

    /// Complete the oldest tracked prepare for `key` after the active sent
    /// its commit or abort. Completions arrive in prepare-seqno order; a
    /// completion that is not for the front of the tracker is rejected.
    pub fn complete_sync_write(
        &mut self,
        key: &DocKey,
        prepare_seqno: Seqno,
        _resolution: Resolution,
    ) -> Result<(), EngineError> {
        let front = self.tracked.front().ok_or(EngineError::KeyNotFound)?;
        if front.item.by_seqno != prepare_seqno || &front.item.key != key {
            return Err(EngineError::NotSupported);
        }
        self.tracked.pop_front();
        if prepare_seqno > self.high_completed_seqno {
            self.high_completed_seqno = prepare_seqno;
        }
        Ok(())
    }

    /// Discard all tracked prepares (vBucket went dead). Replica prepares
    /// have no cookies; nothing to notify, nothing to apply.
    pub fn abandon_all(&mut self) -> Vec<ResolvedSyncWrite> {
        self.tracked.clear();
        Vec::new()
    }

    /// Disassemble for a takeover role switch.
    pub(crate) fn into_parts(self) -> (Vec<TransferredWrite>, Seqno, Seqno, Seqno) {
        (
            self.tracked
                .into_iter()
                .map(|w| TransferredWrite {
                    item: w.item,
                    locally_persisted: w.locally_persisted,
                })
                .collect(),
            self.high_prepared_seqno,
            self.high_completed_seqno,
            self.last_persisted_seqno,
        )
    }
}

impl Default for PassiveDurabilityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
