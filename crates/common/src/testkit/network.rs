use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;

use super::peer::TestPeer;
use crate::swarm::MemoryNetwork;

/// A coordinator for multiple test peers
///
/// TestNetwork owns the in-process network all its peers share and
/// provides utilities for eventual consistency testing. It must be
/// created inside a tokio runtime.
pub struct TestNetwork {
    network: MemoryNetwork,
    /// All peers in the network, indexed by name
    peers: HashMap<String, TestPeer>,
}

impl TestNetwork {
    /// Create a new test network
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            peers: HashMap::new(),
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Add a new in-memory peer to the network
    ///
    /// # Arguments
    /// * `name` - Unique name for this peer
    pub fn add_peer(&mut self, name: impl Into<String>) -> Result<&TestPeer> {
        let name = name.into();

        if self.peers.contains_key(&name) {
            return Err(anyhow::anyhow!("Peer '{}' already exists", name));
        }

        let peer = TestPeer::new(name.clone(), &self.network);
        Ok(self.peers.entry(name).or_insert(peer))
    }

    /// Get a peer by name
    pub fn peer(&self, name: &str) -> Option<&TestPeer> {
        self.peers.get(name)
    }

    /// Get all peer names
    pub fn peer_names(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Remove a peer from the network and stop it
    pub async fn remove_peer(&mut self, name: &str) -> Result<()> {
        if let Some(peer) = self.peers.remove(name) {
            peer.stop().await?;
        }
        Ok(())
    }

    /// Shutdown all peers in the network
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down test network with {} peers", self.peers.len());

        for (name, peer) in self.peers.iter() {
            if let Err(e) = peer.stop().await {
                tracing::error!("Error stopping peer {}: {}", name, e);
            }
        }

        self.peers.clear();
        Ok(())
    }

    /// Poll a condition until it succeeds or times out
    ///
    /// This is useful for testing eventual consistency across peers.
    ///
    /// # Example
    /// ```rust,ignore
    /// net.eventually(Duration::from_secs(5), || async {
    ///     Ok(rehoster.served_keys().len() == 3)
    /// }).await?;
    /// ```
    pub async fn eventually<F, Fut>(&self, timeout: Duration, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        eventually(timeout, condition).await
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
///  Errors from the condition count as not yet.
pub async fn eventually<F, Fut>(timeout: Duration, condition: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let start = std::time::Instant::now();
    let poll_interval = Duration::from_millis(10);

    loop {
        match condition().await {
            Ok(true) => {
                tracing::debug!("Eventual condition met after {:?}", start.elapsed());
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!("Eventual condition check error: {}", e);
            }
        }

        if start.elapsed() > timeout {
            return Err(anyhow::anyhow!(
                "Condition not met within timeout ({:?})",
                timeout
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_lifecycle() -> Result<()> {
        let mut net = TestNetwork::new();

        net.add_peer("alice")?;
        net.add_peer("bob")?;
        assert!(net.add_peer("bob").is_err());

        assert_eq!(net.peer_names().len(), 2);
        assert_eq!(net.network().peer_count(), 2);

        net.remove_peer("alice").await?;
        assert!(net.peer("alice").is_none());
        assert_eq!(net.network().peer_count(), 1);

        net.shutdown().await?;
        assert_eq!(net.peer_names().len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_eventually_timeout() {
        let result = eventually(Duration::from_millis(50), || async { Ok(false) }).await;
        assert!(result.unwrap_err().to_string().contains("timeout"));
    }
}
