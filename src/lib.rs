//! ebbstore - a durable vBucket storage engine
//!
//! The server-side write pipeline of a distributed key-value bucket:
//! - **VBucket**: per-shard hash table plus the Pending → Committed/Aborted
//!   SyncWrite state machine
//! - **CheckpointManager**: the ordered in-memory mutation log, with cursors
//!   for the flusher and replication streams, item expelling, and
//!   closed-checkpoint removal
//! - **Flusher**: background draining of persistence cursors into a
//!   pluggable [`kvstore::KVStore`]
//! - **DurabilityMonitor**: majority/persistence tracking that decides when
//!   a prepared SyncWrite commits
//!
//! # Quick start
//!
//! ```rust,ignore
//! use ebbstore::prelude::*;
//!
//! let ctx = RuntimeContext::default();
//! let bucket = EpBucket::new(ctx, Arc::new(MemoryKvStore::new()));
//! bucket.set_vbucket_state(0, VBucketStateKind::Active, topology)?;
//!
//! bucket.set(0, &DocKey::new("k"), b"v".to_vec(), WriteOptions::default(), None)?;
//! bucket.flush_vbucket_to_empty(0)?;
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod bucket;
pub mod checkpoint;
pub mod config;
pub mod durability;
pub mod executor;
pub mod flusher;
pub mod hash_table;
pub mod hlc;
pub mod item;
pub mod kvstore;
pub mod stats;
pub mod status;
pub mod topology;
pub mod vbucket;

// Re-exports for convenience
pub use bucket::{Bucket, EpBucket, EphemeralBucket};
pub use item::{DocKey, DurabilityLevel, QueuedItem, Seqno};
pub use status::EngineError;

/// Constants used throughout the engine
pub mod constants {
    /// Reserved sequence number; real seqnos start at 1.
    pub const SEQNO_INVALID: u64 = 0;

    /// Name of the always-present persistence cursor.
    pub const PERSISTENCE_CURSOR: &str = crate::checkpoint::PERSISTENCE_CURSOR;

    /// Maximum durability chain size (active plus two replicas).
    pub const MAX_CHAIN_SIZE: usize = crate::topology::MAX_CHAIN_SIZE;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::bucket::{Bucket, EpBucket, EphemeralBucket};
    pub use crate::durability::{client_cookie, SyncWriteResult};
    pub use crate::executor::RuntimeContext;
    pub use crate::item::{DocKey, DurabilityLevel, DurabilityRequirements};
    pub use crate::kvstore::{KVStore, MemoryKvStore};
    pub use crate::status::EngineError;
    pub use crate::topology::ReplicationTopology;
    pub use crate::vbucket::{VBucket, VBucketStateKind, WriteOptions};
}
