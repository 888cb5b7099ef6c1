//! Durability monitor for the active role.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use tracing::{debug, trace};

use crate::durability::{
    AbortReason, CookieHandle, PassiveDurabilityMonitor, Resolution, ResolvedSyncWrite,
    TransferredWrite,
};
use crate::item::{QueuedItemPtr, Seqno};
use crate::topology::ReplicationTopology;

/// One in-flight prepare tracked by the active monitor.
#[derive(Debug)]
pub struct TrackedWrite {
    /// The prepare item.
    pub item: QueuedItemPtr,
    /// Parked client cookie, if any.
    pub cookie: Option<CookieHandle>,
    /// Absolute deadline; `None` means no timeout.
    pub deadline: Option<Instant>,
    /// Replica nodes that have acknowledged this seqno. A replica ack means
    /// the prepare is satisfied at its own level on that node, so for
    /// persistence levels these double as persistence acks.
    acks: HashSet<String>,
    /// Whether the active's own requirement for this level is met
    /// (immediately for Majority, on local persistence otherwise).
    active_satisfied: bool,
    /// Whether the active has persisted this seqno.
    locally_persisted: bool,
    /// Inherited through a passive→active takeover: once a topology exists,
    /// commit is immediate if locally persisted, irrespective of level.
    takeover: bool,
}

/// Tracks prepares on a vBucket leading a durability chain.
#[derive(Debug)]
pub struct ActiveDurabilityMonitor {
    topology: Option<ReplicationTopology>,
    tracked: VecDeque<TrackedWrite>,
    resolved: Vec<ResolvedSyncWrite>,
    high_prepared_seqno: Seqno,
    high_completed_seqno: Seqno,
    last_persisted_seqno: Seqno,
}

impl ActiveDurabilityMonitor {
    /// Monitor with the given (possibly absent) topology.
    pub fn new(topology: Option<ReplicationTopology>) -> Self {
        Self {
            topology,
            tracked: VecDeque::new(),
            resolved: Vec::new(),
            high_prepared_seqno: 0,
            high_completed_seqno: 0,
            last_persisted_seqno: 0,
        }
    }

    /// Build from a passive monitor during takeover. Outstanding prepares
    /// transfer intact; their commit is immediate once a topology arrives if
    /// they were persisted locally.
    pub(crate) fn from_passive(
        pdm: PassiveDurabilityMonitor,
        topology: Option<ReplicationTopology>,
    ) -> Self {
        let (writes, hps, hcs, persisted) = pdm.into_parts();
        let mut adm = Self {
            topology: None,
            tracked: writes
                .into_iter()
                .map(|TransferredWrite { item, locally_persisted }| TrackedWrite {
                    item,
                    cookie: None,
                    deadline: None,
                    acks: HashSet::new(),
                    active_satisfied: locally_persisted,
                    locally_persisted,
                    takeover: true,
                })
                .collect(),
            resolved: Vec::new(),
            high_prepared_seqno: hps,
            high_completed_seqno: hcs,
            last_persisted_seqno: persisted,
        };
        adm.set_topology(topology);
        adm
    }

    /// Current topology, if set.
    pub fn topology(&self) -> Option<&ReplicationTopology> {
        self.topology.as_ref()
    }

    /// Replace the topology and re-evaluate every tracked prepare against
    /// the new chain.
    pub fn set_topology(&mut self, topology: Option<ReplicationTopology>) {
        if let Some(t) = &topology {
            debug!(chain = ?t.nodes(), "durability topology updated");
        }
        self.topology = topology;
        self.check_for_commit();
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

    /// Start tracking an accepted prepare.
    pub fn track(
        &mut self,
        item: QueuedItemPtr,
        cookie: Option<CookieHandle>,
        deadline: Option<Instant>,
    ) {
        let level = item
            .durability
            .map(|d| d.level)
            .unwrap_or(crate::item::DurabilityLevel::Majority);
        let persisted = self.last_persisted_seqno >= item.by_seqno;
        let active_satisfied = persisted || !level.requires_active_persistence();
        trace!(seqno = item.by_seqno, ?level, "tracking prepare");
        self.tracked.push_back(TrackedWrite {
            item,
            cookie,
            deadline,
            acks: HashSet::new(),
            active_satisfied,
            locally_persisted: persisted,
            takeover: false,
        });
        self.update_high_prepared_seqno();
        self.check_for_commit();
    }

    /// Record a replica's acknowledgement of every prepare up to `seqno`.
    /// Acks for already-completed prepares are discarded.
    pub fn seqno_ack(&mut self, node: &str, seqno: Seqno) {
        for write in self.tracked.iter_mut() {
            if write.item.by_seqno > seqno {
                break;
            }
            write.acks.insert(node.to_string());
        }
        self.check_for_commit();
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
            write.active_satisfied = true;
        }
        self.update_high_prepared_seqno();
        self.check_for_commit();
    }

    /// Abort every tracked prepare whose deadline has elapsed.
    pub fn tick(&mut self, now: Instant) {
        let mut remaining = VecDeque::with_capacity(self.tracked.len());
        for write in self.tracked.drain(..) {
            let expired = write.deadline.is_some_and(|d| d <= now);
            if expired {
                debug!(seqno = write.item.by_seqno, "prepare timed out, aborting");
                self.resolved.push(ResolvedSyncWrite {
                    key: write.item.key.clone(),
                    prepare_seqno: write.item.by_seqno,
                    resolution: Resolution::Abort(AbortReason::Timeout),
                    cookie: write.cookie,
                });
                if write.item.by_seqno > self.high_completed_seqno {
                    self.high_completed_seqno = write.item.by_seqno;
                }
            } else {
                remaining.push_back(write);
            }
        }
        self.tracked = remaining;
        // Aborting blockers may allow later prepares to commit.
        self.check_for_commit();
    }

    /// Abort every tracked prepare (state change away from active).
    pub fn abort_all(&mut self, reason: AbortReason) -> Vec<ResolvedSyncWrite> {
        let mut out: Vec<ResolvedSyncWrite> = self.resolved.drain(..).collect();
        for write in self.tracked.drain(..) {
            if write.item.by_seqno > self.high_completed_seqno {
                self.high_completed_seqno = write.item.by_seqno;
            }
            out.push(ResolvedSyncWrite {
                key: write.item.key.clone(),
                prepare_seqno: write.item.by_seqno,
                resolution: Resolution::Abort(reason),
                cookie: write.cookie,
            });
        }
        out
    }

    /// Take the decisions made since the last drain.
    pub fn drain_resolved(&mut self) -> Vec<ResolvedSyncWrite> {
        std::mem::take(&mut self.resolved)
    }

    /// Stop tracking one prepare because the vBucket completed it directly
    /// (explicit commit or abort). Returns the parked cookie, if any;
    /// completing a blocker may release later prepares into the resolved
    /// queue.
    pub fn remove_tracked(
        &mut self,
        key: &crate::item::DocKey,
        prepare_seqno: Seqno,
    ) -> Option<Option<CookieHandle>> {
        let idx = self
            .tracked
            .iter()
            .position(|w| w.item.by_seqno == prepare_seqno && &w.item.key == key)?;
        let write = self.tracked.remove(idx)?;
        if write.item.by_seqno > self.high_completed_seqno {
            self.high_completed_seqno = write.item.by_seqno;
        }
        self.check_for_commit();
        Some(write.cookie)
    }

    /// Disassemble for a role switch to passive.
    pub(crate) fn into_parts(
        self,
    ) -> (
        Vec<TransferredWrite>,
        Vec<CookieHandle>,
        Seqno,
        Seqno,
        Seqno,
    ) {
        let mut writes = Vec::with_capacity(self.tracked.len());
        let mut cookies = Vec::new();
        for w in self.tracked {
            if let Some(cookie) = w.cookie {
                cookies.push(cookie);
            }
            writes.push(TransferredWrite {
                item: w.item,
                locally_persisted: w.locally_persisted,
            });
        }
        (
            writes,
            cookies,
            self.high_prepared_seqno,
            self.high_completed_seqno,
            self.last_persisted_seqno,
        )
    }

    fn update_high_prepared_seqno(&mut self) {
        // HPS is the highest prepare seqno whose local requirement (and that
        // of every earlier prepare) is met.
        let mut hps = self.high_prepared_seqno;
        for write in &self.tracked {
            if !write.active_satisfied {
                break;
            }
            hps = write.item.by_seqno;
        }
        self.high_prepared_seqno = hps;
    }

    /// Commit rule: in seqno order, a prepare commits once acknowledged by a
    /// majority of the chain including the active, with the active persisted
    /// for persistence levels. Commits are strictly in order: an
    /// uncommittable prepare blocks everything behind it.
    fn check_for_commit(&mut self) {
        loop {
            let Some(front) = self.tracked.front() else {
                break;
            };
            if !self.is_satisfied(front) {
                break;
            }
            let write = self
                .tracked
                .pop_front()
                .expect("front checked non-empty above");
            self.high_completed_seqno = write.item.by_seqno;
            trace!(seqno = write.item.by_seqno, "prepare satisfied, committing");
            self.resolved.push(ResolvedSyncWrite {
                key: write.item.key.clone(),
                prepare_seqno: write.item.by_seqno,
                resolution: Resolution::Commit,
                cookie: write.cookie,
            });
        }
    }

    fn is_satisfied(&self, write: &TrackedWrite) -> bool {
        let Some(topology) = &self.topology else {
            return false;
        };
        if write.takeover && write.locally_persisted {
            return true;
        }
        if !topology.supports_sync_writes() {
            return false;
        }
        if !write.active_satisfied {
            return false;
        }
        let level = match write.item.durability {
            Some(d) => d.level,
            None => return false,
        };
        if level.requires_active_persistence() && !write.locally_persisted {
            return false;
        }
        let replica_acks = topology
            .replicas()
            .iter()
            .filter(|node| write.acks.contains(node.as_str()))
            .count();
        1 + replica_acks >= topology.majority()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durability::client_cookie;
    use crate::item::{
        CommittedState, Datatype, DocKey, DurabilityLevel, DurabilityRequirements, QueueOp,
        QueuedItem,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn prepare(seqno: Seqno, level: DurabilityLevel) -> QueuedItemPtr {
        Arc::new(QueuedItem {
            key: DocKey::new(format!("k{seqno}")),
            value: b"v".to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: seqno,
            by_seqno: seqno,
            rev_seqno: 1,
            op: QueueOp::PendingSyncWrite,
            committed: CommittedState::Pending,
            durability: Some(DurabilityRequirements::new(level)),
            deleted: false,
            prepare_seqno: None,
        })
    }

    fn topology(nodes: &[&str]) -> Option<ReplicationTopology> {
        Some(ReplicationTopology::from_nodes(nodes).unwrap())
    }

    #[test]
    fn test_majority_commit_on_replica_ack() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        adm.track(prepare(1, DurabilityLevel::Majority), None, None);
        assert!(adm.drain_resolved().is_empty());

        adm.seqno_ack("replica", 1);
        let resolved = adm.drain_resolved();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolution, Resolution::Commit);
        assert_eq!(resolved[0].prepare_seqno, 1);
        assert_eq!(adm.high_completed_seqno(), 1);
        assert_eq!(adm.num_tracked(), 0);
    }

    #[test]
    fn test_single_node_chain_commits_immediately() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active"]));
        adm.track(prepare(1, DurabilityLevel::Majority), None, None);
        let resolved = adm.drain_resolved();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolution, Resolution::Commit);
    }

    #[test]
    fn test_persist_to_majority_needs_local_persistence() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        adm.track(prepare(1, DurabilityLevel::PersistToMajority), None, None);
        adm.seqno_ack("replica", 1);
        // Replica has acked but the active has not persisted: no commit.
        assert!(adm.drain_resolved().is_empty());
        assert_eq!(adm.high_prepared_seqno(), 0);

        adm.persisted_up_to(1);
        let resolved = adm.drain_resolved();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolution, Resolution::Commit);
        assert_eq!(adm.high_prepared_seqno(), 1);
    }

    #[test]
    fn test_majority_and_persist_on_master() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        adm.track(
            prepare(1, DurabilityLevel::MajorityAndPersistOnMaster),
            None,
            None,
        );
        adm.persisted_up_to(1);
        // Persisted locally but no replica ack yet: majority not met.
        assert!(adm.drain_resolved().is_empty());
        adm.seqno_ack("replica", 1);
        assert_eq!(adm.drain_resolved().len(), 1);
    }

    #[test]
    fn test_commits_are_in_order() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        adm.track(prepare(1, DurabilityLevel::PersistToMajority), None, None);
        adm.track(prepare(2, DurabilityLevel::Majority), None, None);

        // Seqno 2 is fully satisfied but seqno 1 is not: neither commits.
        adm.seqno_ack("replica", 2);
        assert!(adm.drain_resolved().is_empty());

        // Satisfying seqno 1 releases both, in order.
        adm.persisted_up_to(1);
        let resolved = adm.drain_resolved();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].prepare_seqno, 1);
        assert_eq!(resolved[1].prepare_seqno, 2);
    }

    #[test]
    fn test_three_node_chain_majority() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "r1", "r2"]));
        adm.track(prepare(1, DurabilityLevel::Majority), None, None);
        // majority of 3 is 2: active + one replica suffices.
        adm.seqno_ack("r1", 1);
        assert_eq!(adm.drain_resolved().len(), 1);
    }

    #[test]
    fn test_ack_from_unknown_node_ignored() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        adm.track(prepare(1, DurabilityLevel::Majority), None, None);
        adm.seqno_ack("stranger", 1);
        assert!(adm.drain_resolved().is_empty());
    }

    #[test]
    fn test_oversized_chain_never_commits() {
        let mut adm =
            ActiveDurabilityMonitor::new(topology(&["active", "r1", "r2", "r3"]));
        adm.track(prepare(1, DurabilityLevel::Majority), None, None);
        adm.seqno_ack("r1", 1);
        adm.seqno_ack("r2", 1);
        adm.seqno_ack("r3", 1);
        assert!(adm.drain_resolved().is_empty());
    }

    #[test]
    fn test_timeout_aborts_and_unblocks() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        let now = Instant::now();
        let (cookie, receiver) = client_cookie();
        adm.track(
            prepare(1, DurabilityLevel::PersistToMajority),
            Some(cookie),
            Some(now + Duration::from_millis(10)),
        );
        adm.track(prepare(2, DurabilityLevel::Majority), None, None);
        adm.seqno_ack("replica", 2);
        assert!(adm.drain_resolved().is_empty());

        adm.tick(now + Duration::from_millis(20));
        let resolved = adm.drain_resolved();
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved[0].resolution,
            Resolution::Abort(AbortReason::Timeout)
        );
        assert_eq!(resolved[0].prepare_seqno, 1);
        // Cookie travels with the abort for the vBucket to notify.
        assert!(resolved[0].cookie.is_some());
        assert!(receiver.try_result().is_none());
        // The blocked majority write commits once the blocker is gone.
        assert_eq!(resolved[1].resolution, Resolution::Commit);
        assert_eq!(resolved[1].prepare_seqno, 2);
    }

    #[test]
    fn test_late_ack_after_abort_discarded() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        let now = Instant::now();
        adm.track(
            prepare(1, DurabilityLevel::Majority),
            None,
            Some(now + Duration::from_millis(1)),
        );
        adm.tick(now + Duration::from_millis(5));
        let resolved = adm.drain_resolved();
        assert_eq!(resolved.len(), 1);
        assert!(matches!(resolved[0].resolution, Resolution::Abort(_)));

        // Ack arriving after the abort is a no-op.
        adm.seqno_ack("replica", 1);
        assert!(adm.drain_resolved().is_empty());
        assert_eq!(adm.num_tracked(), 0);
    }

    #[test]
    fn test_no_topology_blocks_commit() {
        let mut adm = ActiveDurabilityMonitor::new(None);
        adm.track(prepare(1, DurabilityLevel::Majority), None, None);
        adm.seqno_ack("replica", 1);
        assert!(adm.drain_resolved().is_empty());

        adm.set_topology(topology(&["active", "replica"]));
        assert_eq!(adm.drain_resolved().len(), 1);
    }

    #[test]
    fn test_abort_all_carries_cookies() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        let (cookie, _receiver) = client_cookie();
        adm.track(prepare(1, DurabilityLevel::Majority), Some(cookie), None);
        let resolutions = adm.abort_all(AbortReason::StateChange);
        assert_eq!(resolutions.len(), 1);
        assert_eq!(
            resolutions[0].resolution,
            Resolution::Abort(AbortReason::StateChange)
        );
        assert!(resolutions[0].cookie.is_some());
        assert_eq!(adm.num_tracked(), 0);
    }

    #[test]
    fn test_hps_tracks_persistence_levels() {
        let mut adm = ActiveDurabilityMonitor::new(topology(&["active", "replica"]));
        adm.track(prepare(1, DurabilityLevel::Majority), None, None);
        assert_eq!(adm.high_prepared_seqno(), 1);
        adm.track(prepare(2, DurabilityLevel::PersistToMajority), None, None);
        // Not yet persisted locally: HPS stalls at 1.
        assert_eq!(adm.high_prepared_seqno(), 1);
        adm.persisted_up_to(2);
        assert_eq!(adm.high_prepared_seqno(), 2);
    }
}
