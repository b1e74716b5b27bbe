//! Overlay network plumbing
//!
//! The [`Swarm`] trait is the seam to whatever transport finds peers for a
//! topic. [`SwarmMembership`] sits on top of it and ref-counts how many
//! graph nodes want each topic served or merely requested, so the physical
//! join state always follows the counters.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::crypto::DiscoveryKey;

mod memory;
mod membership;

pub use membership::SwarmMembership;
pub use memory::{MemoryNetwork, MemorySwarm};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SwarmError {
    #[error("swarm has been destroyed")]
    Destroyed,
    #[error("failed to join topic {0}: {1}")]
    Join(DiscoveryKey, String),
    #[error("failed to leave topic {0}: {1}")]
    Leave(DiscoveryKey, String),
}

/// Role to take on a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinOptions {
    /// Announce the topic and accept connections
    pub server: bool,
    /// Look up peers announcing the topic
    pub client: bool,
}

impl JoinOptions {
    pub fn serve() -> Self {
        Self {
            server: true,
            client: true,
        }
    }

    pub fn request() -> Self {
        Self {
            server: false,
            client: true,
        }
    }
}

#[async_trait]
pub trait Swarm: Send + Sync + Debug + 'static {
    /// Join a topic, replacing the options of an earlier join
    async fn join(&self, topic: DiscoveryKey, opts: JoinOptions) -> Result<(), SwarmError>;

    async fn leave(&self, topic: DiscoveryKey) -> Result<(), SwarmError>;

    /// Topics currently joined, with their options
    fn topics(&self) -> Vec<(DiscoveryKey, JoinOptions)>;

    /// Leave everything and drop all connections
    async fn destroy(&self) -> Result<(), SwarmError>;
}
