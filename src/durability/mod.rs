//! SyncWrite durability tracking.
//!
//! A vBucket owns one [`DurabilityMonitor`], whose role follows the vBucket
//! state: Active monitors lead a replication chain and decide commits;
//! Passive monitors track prepares received from the active. Role switches
//! carry outstanding prepares across intact.
//!
//! Monitors never call back into the vBucket while locked. Decisions are
//! queued internally as [`ResolvedSyncWrite`]s; the vBucket drains the queue
//! after releasing the monitor and performs the commit/abort appends and
//! cookie notifications.

mod active;
mod passive;

pub use active::{ActiveDurabilityMonitor, TrackedWrite};
pub use passive::PassiveDurabilityMonitor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver, Sender, RecvTimeoutError};

use crate::item::{DocKey, QueuedItemPtr, Seqno};
use crate::status::EngineError;
use crate::topology::ReplicationTopology;

/// Terminal outcome of a SyncWrite, delivered asynchronously to the cookie
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWriteResult {
    /// The prepare committed; `cas` is the committed document's version.
    Success {
        /// CAS of the committed document.
        cas: u64,
    },
    /// The outcome is unknown to the client: the prepare timed out or the
    /// vBucket left the active state. The client must re-read or retry.
    Ambiguous,
    /// The connection went away before completion.
    Cancelled,
}

static NEXT_COOKIE_ID: AtomicU64 = AtomicU64::new(1);

/// Engine-side half of a parked client cookie. Stored in the durability
/// monitor entry for the prepare; completion is a message back to the
/// frontend that owns the connection.
#[derive(Debug)]
pub struct CookieHandle {
    id: u64,
    tx: Sender<SyncWriteResult>,
}

impl CookieHandle {
    /// Opaque id of this cookie.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver the terminal result. Delivery to a departed client is a
    /// no-op.
    pub fn notify(&self, result: SyncWriteResult) {
        let _ = self.tx.send(result);
    }
}

/// Client-side half of a parked cookie.
#[derive(Debug)]
pub struct CookieReceiver {
    rx: Receiver<SyncWriteResult>,
}

impl CookieReceiver {
    /// Non-blocking poll for the result.
    pub fn try_result(&self) -> Option<SyncWriteResult> {
        self.rx.try_recv().ok()
    }

    /// Block until the result arrives or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Option<SyncWriteResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Create a connected cookie pair.
pub fn client_cookie() -> (CookieHandle, CookieReceiver) {
    let (tx, rx) = unbounded();
    (
        CookieHandle {
            id: NEXT_COOKIE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        },
        CookieReceiver { rx },
    )
}

/// Why a tracked prepare was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The prepare's deadline elapsed.
    Timeout,
    /// The vBucket transitioned out of the active state.
    StateChange,
}

/// Decision taken on a tracked prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Commit the prepare.
    Commit,
    /// Abort the prepare.
    Abort(AbortReason),
}

/// A prepare the monitor has decided on, ready for the vBucket to apply.
#[derive(Debug)]
pub struct ResolvedSyncWrite {
    /// Key of the prepare.
    pub key: DocKey,
    /// Seqno of the prepare.
    pub prepare_seqno: Seqno,
    /// The decision.
    pub resolution: Resolution,
    /// Cookie to notify once applied, if a client is parked.
    pub cookie: Option<CookieHandle>,
}

/// Role-dispatching wrapper owned by the vBucket.
#[derive(Debug)]
pub enum DurabilityMonitor {
    /// Leading a chain; decides commits.
    Active(ActiveDurabilityMonitor),
    /// Following a chain; tracks prepares from the active.
    Passive(PassiveDurabilityMonitor),
}

impl DurabilityMonitor {
    /// Number of outstanding tracked prepares.
    pub fn num_tracked(&self) -> usize {
        match self {
            DurabilityMonitor::Active(adm) => adm.num_tracked(),
            DurabilityMonitor::Passive(pdm) => pdm.num_tracked(),
        }
    }

    /// High-prepared-seqno watermark.
    pub fn high_prepared_seqno(&self) -> Seqno {
        match self {
            DurabilityMonitor::Active(adm) => adm.high_prepared_seqno(),
            DurabilityMonitor::Passive(pdm) => pdm.high_prepared_seqno(),
        }
    }

    /// High-completed-seqno watermark.
    pub fn high_completed_seqno(&self) -> Seqno {
        match self {
            DurabilityMonitor::Active(adm) => adm.high_completed_seqno(),
            DurabilityMonitor::Passive(pdm) => pdm.high_completed_seqno(),
        }
    }

    /// Forward a local-persistence notification.
    pub fn persisted_up_to(&mut self, seqno: Seqno) {
        match self {
            DurabilityMonitor::Active(adm) => adm.persisted_up_to(seqno),
            DurabilityMonitor::Passive(pdm) => pdm.persisted_up_to(seqno),
        }
    }

    /// Drain decisions ready to be applied by the vBucket.
    pub fn drain_resolved(&mut self) -> Vec<ResolvedSyncWrite> {
        match self {
            DurabilityMonitor::Active(adm) => adm.drain_resolved(),
            DurabilityMonitor::Passive(_) => Vec::new(),
        }
    }

    /// Expire overdue prepares (active role only).
    pub fn tick(&mut self, now: Instant) {
        if let DurabilityMonitor::Active(adm) = self {
            adm.tick(now);
        }
    }

    /// Switch to the active role, carrying outstanding prepares across.
    /// Cookies cannot survive a role change that started passive, so
    /// inherited prepares complete without notification.
    pub fn into_active(self, topology: Option<ReplicationTopology>) -> DurabilityMonitor {
        match self {
            DurabilityMonitor::Active(mut adm) => {
                adm.set_topology(topology);
                DurabilityMonitor::Active(adm)
            }
            DurabilityMonitor::Passive(pdm) => {
                DurabilityMonitor::Active(ActiveDurabilityMonitor::from_passive(pdm, topology))
            }
        }
    }

    /// Switch to the passive role. Outstanding prepares transfer intact;
    /// their parked clients are notified ambiguous, since this node can no
    /// longer decide their outcome. Returns the notifications to deliver.
    pub fn into_passive(self) -> (DurabilityMonitor, Vec<(CookieHandle, SyncWriteResult)>) {
        match self {
            DurabilityMonitor::Passive(pdm) => (DurabilityMonitor::Passive(pdm), Vec::new()),
            DurabilityMonitor::Active(adm) => {
                let (pdm, cookies) = PassiveDurabilityMonitor::from_active(adm);
                let notifications = cookies
                    .into_iter()
                    .map(|c| (c, SyncWriteResult::Ambiguous))
                    .collect();
                (DurabilityMonitor::Passive(pdm), notifications)
            }
        }
    }

    /// Abort every in-flight prepare (vBucket went dead). Returns the
    /// resolutions for the vBucket to apply and notify.
    pub fn abort_all_for_state_change(&mut self) -> Vec<ResolvedSyncWrite> {
        match self {
            DurabilityMonitor::Active(adm) => adm.abort_all(AbortReason::StateChange),
            DurabilityMonitor::Passive(pdm) => pdm.abandon_all(),
        }
    }

    /// The active monitor, if in that role.
    pub fn as_active_mut(&mut self) -> Result<&mut ActiveDurabilityMonitor, EngineError> {
        match self {
            DurabilityMonitor::Active(adm) => Ok(adm),
            DurabilityMonitor::Passive(_) => Err(EngineError::NotMyVBucket),
        }
    }

    /// The passive monitor, if in that role.
    pub fn as_passive_mut(&mut self) -> Result<&mut PassiveDurabilityMonitor, EngineError> {
        match self {
            DurabilityMonitor::Passive(pdm) => Ok(pdm),
            DurabilityMonitor::Active(_) => Err(EngineError::NotMyVBucket),
        }
    }
}

/// A prepare carried across a role switch.
#[derive(Debug)]
pub(crate) struct TransferredWrite {
    pub item: QueuedItemPtr,
    pub locally_persisted: bool,
}
