use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::crypto::{PublicKey, SecretKey};
use crate::events::EventSink;
use crate::index::{Header, KeyedIndex};
use crate::log::{LocalLog, LocalLogStore, LogStore, ReplicatedLog};
use crate::rehoster::{Rehoster, RehosterConfig};
use crate::swarm::{JoinOptions, MemoryNetwork, MemorySwarm, Swarm};

/// A test peer with convenience methods for integration testing
///
/// Logs created through the peer are announced on its own publishing
/// swarm. Every rehoster it opens gets a separate swarm on the same
/// network, so closing a rehoster never withdraws the peer's own logs.
#[derive(Debug)]
pub struct TestPeer {
    /// The name of this peer (for debugging)
    pub name: String,
    logs: LocalLogStore,
    network: MemoryNetwork,
    publisher: MemorySwarm,
}

impl TestPeer {
    /// Create a peer with an in-memory log store
    pub fn new(name: impl Into<String>, network: &MemoryNetwork) -> Self {
        Self::with_logs(name, network, LocalLogStore::memory())
    }

    /// Create a peer whose logs persist under `dir`
    pub async fn persistent(
        name: impl Into<String>,
        network: &MemoryNetwork,
        dir: impl AsRef<Path>,
        seed: SecretKey,
    ) -> Result<Self> {
        let logs = LocalLogStore::fs(dir, seed).await?;
        Ok(Self::with_logs(name, network, logs))
    }

    fn with_logs(name: impl Into<String>, network: &MemoryNetwork, logs: LocalLogStore) -> Self {
        let name = name.into();
        let publisher = network.swarm(&logs);
        tracing::debug!("[{}] peer attached to network", name);
        Self {
            name,
            logs,
            network: network.clone(),
            publisher,
        }
    }

    /// Get reference to the log store
    pub fn logs(&self) -> &LocalLogStore {
        &self.logs
    }

    // ========================================
    // Log Operations
    // ========================================

    /// Create a writable plain log holding `blocks`, announced on the network
    pub async fn create_log(&self, name: &str, blocks: &[&str]) -> Result<LocalLog> {
        let log = self.logs.create(name).await?;
        for block in blocks {
            log.append(Bytes::copy_from_slice(block.as_bytes())).await?;
        }
        self.publish(log.key()).await?;
        tracing::debug!("[{}] created log {} ({} blocks)", self.name, name, blocks.len());
        Ok(log)
    }

    /// Create a drive: a keyed index whose header names a content log.
    ///  Returns the index log and the content log, both announced.
    pub async fn create_drive(&self, name: &str) -> Result<(LocalLog, LocalLog)> {
        let content = self.logs.create(&format!("{}/content", name)).await?;
        content.append(Bytes::from_static(b"file contents")).await?;

        let log = self.logs.create(name).await?;
        let index = KeyedIndex::new(log.clone());
        index
            .init_header(Header::with_content_feed(content.key()))
            .await?;
        index.put(b"/file.txt", b"0", None).await?;

        self.publish(log.key()).await?;
        self.publish(content.key()).await?;
        tracing::debug!("[{}] created drive {}", self.name, name);
        Ok((log, content))
    }

    /// Announce a log this peer holds
    pub async fn publish(&self, key: PublicKey) -> Result<()> {
        self.publisher
            .join(key.discovery_key(), JoinOptions::serve())
            .await?;
        Ok(())
    }

    // ========================================
    // Rehoster Operations
    // ========================================

    /// Open this peer's default rehoster
    pub async fn rehoster(&self) -> Result<Rehoster<LocalLogStore>> {
        self.rehoster_with(RehosterConfig::default(), EventSink::default())
            .await
    }

    /// Open a rehoster with its own config and event sink
    pub async fn rehoster_with(
        &self,
        config: RehosterConfig,
        events: EventSink,
    ) -> Result<Rehoster<LocalLogStore>> {
        let swarm: Arc<dyn Swarm> = Arc::new(self.network.swarm(&self.logs));
        let rehoster = Rehoster::open_with_events(self.logs.clone(), swarm, config, events).await?;
        tracing::info!("[{}] rehoster {} open", self.name, rehoster.own_key().short());
        Ok(rehoster)
    }

    /// Withdraw everything this peer announced
    pub async fn stop(&self) -> Result<()> {
        self.publisher.destroy().await?;
        tracing::info!("[{}] peer stopped", self.name);
        Ok(())
    }
}
