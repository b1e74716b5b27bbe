//! The replication graph
//!
//! Every distinct public key reachable from a root is tracked by exactly one
//! [`GraphNode`], owned by the [`NodeManager`]. Whoever references a key
//! (the root, a parent index, a drive's content log) holds a [`NodeRef`]:
//! a ref-counted claim carrying its own description and network role. Cycles
//! and duplicates collapse onto the shared node instead of recursing.

use crate::crypto::PublicKey;
use crate::index::IndexError;
use crate::log::LogError;
use crate::swarm::SwarmError;

mod manager;
mod node;

pub use manager::{NodeManager, NodeOptions, NodeRef};
pub use node::{GraphNode, NodeState};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("failed to open log {key}: {source}")]
    Open { key: PublicKey, source: LogError },
    #[error("failed to read index {key}: {source}")]
    Index { key: PublicKey, source: IndexError },
    #[error("failed to update network role of {key}: {source}")]
    Membership { key: PublicKey, source: SwarmError },
    #[error("failed to close log {key}: {source}")]
    Close { key: PublicKey, source: LogError },
    #[error("network error: {0}")]
    Network(#[from] SwarmError),
    #[error("node manager is closed")]
    ManagerClosed,
}
