//! Replication topology for the durability chain of a vBucket.

use serde::{Deserialize, Serialize};

use crate::status::EngineError;

/// Maximum chain length: one active plus two replicas. Longer chains cannot
/// guarantee no data loss across failover and rollback, so SyncWrites against
/// them are refused at admission.
pub const MAX_CHAIN_SIZE: usize = 3;

/// Ordered durability chain: the first node is the active, the rest replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTopology {
    chain: Vec<String>,
}

impl ReplicationTopology {
    /// Build a topology from an ordered chain of node names.
    ///
    /// The chain must be non-empty and node names must be unique and
    /// non-empty. Over-long chains are accepted here (topology is an input
    /// set by ns_server); write admission rejects them per-operation.
    pub fn new(chain: Vec<String>) -> Result<Self, EngineError> {
        if chain.is_empty() {
            return Err(EngineError::InvalidArguments);
        }
        for (i, node) in chain.iter().enumerate() {
            if node.is_empty() || chain[..i].contains(node) {
                return Err(EngineError::InvalidArguments);
            }
        }
        Ok(Self { chain })
    }

    /// Convenience constructor from string slices.
    pub fn from_nodes(nodes: &[&str]) -> Result<Self, EngineError> {
        Self::new(nodes.iter().map(|s| s.to_string()).collect())
    }

    /// The active node's name.
    pub fn active(&self) -> &str {
        &self.chain[0]
    }

    /// Replica node names, in chain order.
    pub fn replicas(&self) -> &[String] {
        &self.chain[1..]
    }

    /// Total chain size including the active.
    pub fn size(&self) -> usize {
        self.chain.len()
    }

    /// Majority threshold: floor(size / 2) + 1.
    pub fn majority(&self) -> usize {
        self.chain.len() / 2 + 1
    }

    /// Whether SyncWrites can be admitted against this chain.
    pub fn supports_sync_writes(&self) -> bool {
        self.chain.len() <= MAX_CHAIN_SIZE
    }

    /// Whether `node` is part of the chain.
    pub fn contains(&self, node: &str) -> bool {
        self.chain.iter().any(|n| n == node)
    }

    /// The full chain, active first.
    pub fn nodes(&self) -> &[String] {
        &self.chain
    }
}
