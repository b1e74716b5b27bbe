use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{JoinOptions, Swarm, SwarmError};
use crate::crypto::DiscoveryKey;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    served: u64,
    requested: u64,
}

impl Counters {
    /// Physical membership these counters call for
    fn target(&self) -> Option<JoinOptions> {
        if self.served > 0 {
            Some(JoinOptions::serve())
        } else if self.requested > 0 {
            Some(JoinOptions::request())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Serve,
    Request,
}

/// Ref-counted topic membership
///
/// Every graph node that wants a topic announced calls [`serve`], every node
/// that only wants to replicate it calls [`request`]. The topic is joined as a
/// server while anything serves it, as a client while anything requests it,
/// and left when nothing does. Queries read the counters, not the swarm, so
/// they are consistent even while a join is in flight.
///
/// [`serve`]: SwarmMembership::serve
/// [`request`]: SwarmMembership::request
#[derive(Debug)]
pub struct SwarmMembership {
    swarm: Arc<dyn Swarm>,
    counters: Mutex<HashMap<DiscoveryKey, Counters>>,
    /// Serializes physical joins and leaves so they apply in counter order
    transitions: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SwarmMembership {
    pub fn new(swarm: Arc<dyn Swarm>) -> Self {
        Self {
            swarm,
            counters: Mutex::new(HashMap::new()),
            transitions: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn swarm(&self) -> &Arc<dyn Swarm> {
        &self.swarm
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn serve(&self, topic: DiscoveryKey) -> Result<(), SwarmError> {
        self.increment(topic, Role::Serve).await
    }

    pub async fn unserve(&self, topic: DiscoveryKey) -> Result<(), SwarmError> {
        self.decrement(topic, Role::Serve).await
    }

    pub async fn request(&self, topic: DiscoveryKey) -> Result<(), SwarmError> {
        self.increment(topic, Role::Request).await
    }

    pub async fn unrequest(&self, topic: DiscoveryKey) -> Result<(), SwarmError> {
        self.decrement(topic, Role::Request).await
    }

    async fn increment(&self, topic: DiscoveryKey, role: Role) -> Result<(), SwarmError> {
        if self.is_closed() {
            return Ok(());
        }
        let _transition = self.transitions.lock().await;

        let (before, after) = self.update(topic, |c| match role {
            Role::Serve => c.served += 1,
            Role::Request => c.requested += 1,
        });

        if let Err(e) = self.apply(topic, before, after).await {
            // the join never happened, so neither did the claim
            self.update(topic, |c| match role {
                Role::Serve => c.served -= 1,
                Role::Request => c.requested -= 1,
            });
            return Err(e);
        }
        Ok(())
    }

    async fn decrement(&self, topic: DiscoveryKey, role: Role) -> Result<(), SwarmError> {
        if self.is_closed() {
            return Ok(());
        }
        let _transition = self.transitions.lock().await;

        let (before, after) = self.update(topic, |c| {
            let counter = match role {
                Role::Serve => &mut c.served,
                Role::Request => &mut c.requested,
            };
            debug_assert!(*counter > 0, "{:?} counter underflow for {}", role, topic);
            if *counter == 0 {
                tracing::error!(
                    topic = %topic,
                    ?role,
                    "membership counter would go negative, clamping at zero"
                );
            }
            *counter = counter.saturating_sub(1);
        });

        self.apply(topic, before, after).await
    }

    fn update(&self, topic: DiscoveryKey, f: impl FnOnce(&mut Counters)) -> (Counters, Counters) {
        let mut counters = self.counters.lock();
        let entry = counters.entry(topic).or_default();
        let before = *entry;
        f(entry);
        let after = *entry;
        if after == Counters::default() {
            counters.remove(&topic);
        }
        (before, after)
    }

    /// Move the physical membership from what `before` called for to what `after` does
    async fn apply(
        &self,
        topic: DiscoveryKey,
        before: Counters,
        after: Counters,
    ) -> Result<(), SwarmError> {
        match (before.target(), after.target()) {
            (from, to) if from == to => Ok(()),
            (Some(JoinOptions { server: true, .. }), Some(to)) => {
                // dropping from server to client
                self.swarm.leave(topic).await?;
                tracing::debug!(topic = %topic, "no longer serving, still requested");
                self.swarm.join(topic, to).await
            }
            (_, Some(to)) => {
                tracing::debug!(topic = %topic, server = to.server, "joining topic");
                self.swarm.join(topic, to).await
            }
            (_, None) => {
                tracing::debug!(topic = %topic, "leaving topic");
                self.swarm.leave(topic).await
            }
        }
    }

    /// Topics with at least one serving node
    pub fn served_keys(&self) -> BTreeSet<DiscoveryKey> {
        self.counters
            .lock()
            .iter()
            .filter(|(_, c)| c.served > 0)
            .map(|(topic, _)| *topic)
            .collect()
    }

    /// Topics with at least one requesting node, served or not
    pub fn requested_keys(&self) -> BTreeSet<DiscoveryKey> {
        self.counters
            .lock()
            .iter()
            .filter(|(_, c)| c.requested > 0)
            .map(|(topic, _)| *topic)
            .collect()
    }

    /// Every topic this membership keeps joined
    pub fn all_keys(&self) -> BTreeSet<DiscoveryKey> {
        self.counters.lock().keys().copied().collect()
    }

    /// Leave every topic and destroy the swarm.
    ///  Later calls, and any serve or request after the first, do nothing.
    pub async fn close(&self) -> Result<(), SwarmError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _transition = self.transitions.lock().await;

        let topics: Vec<_> = self.counters.lock().drain().map(|(t, _)| t).collect();
        for topic in topics {
            if let Err(e) = self.swarm.leave(topic).await {
                tracing::warn!(topic = %topic, "failed to leave topic on close: {}", e);
            }
        }
        self.swarm.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::crypto::SecretKey;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Join(DiscoveryKey, JoinOptions),
        Leave(DiscoveryKey),
        Destroy,
    }

    /// Swarm that records calls and optionally fails joins
    #[derive(Debug, Default)]
    struct RecordingSwarm {
        calls: Mutex<Vec<Call>>,
        fail_joins: AtomicBool,
    }

    impl RecordingSwarm {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    #[async_trait]
    impl Swarm for RecordingSwarm {
        async fn join(&self, topic: DiscoveryKey, opts: JoinOptions) -> Result<(), SwarmError> {
            if self.fail_joins.load(Ordering::Relaxed) {
                return Err(SwarmError::Join(topic, "refused".to_string()));
            }
            self.calls.lock().push(Call::Join(topic, opts));
            Ok(())
        }

        async fn leave(&self, topic: DiscoveryKey) -> Result<(), SwarmError> {
            self.calls.lock().push(Call::Leave(topic));
            Ok(())
        }

        fn topics(&self) -> Vec<(DiscoveryKey, JoinOptions)> {
            Vec::new()
        }

        async fn destroy(&self) -> Result<(), SwarmError> {
            self.calls.lock().push(Call::Destroy);
            Ok(())
        }
    }

    fn setup() -> (Arc<RecordingSwarm>, SwarmMembership, DiscoveryKey) {
        let swarm = Arc::new(RecordingSwarm::default());
        let membership = SwarmMembership::new(swarm.clone());
        let topic = SecretKey::generate().public().discovery_key();
        (swarm, membership, topic)
    }

    #[tokio::test]
    async fn test_serve_joins_once() {
        let (swarm, membership, topic) = setup();

        membership.serve(topic).await.unwrap();
        membership.serve(topic).await.unwrap();
        assert_eq!(swarm.take(), vec![Call::Join(topic, JoinOptions::serve())]);

        membership.unserve(topic).await.unwrap();
        assert!(swarm.take().is_empty());
        assert!(membership.served_keys().contains(&topic));

        membership.unserve(topic).await.unwrap();
        assert_eq!(swarm.take(), vec![Call::Leave(topic)]);
        assert!(membership.all_keys().is_empty());
    }

    #[tokio::test]
    async fn test_unserve_falls_back_to_request() {
        let (swarm, membership, topic) = setup();

        membership.request(topic).await.unwrap();
        membership.serve(topic).await.unwrap();
        assert_eq!(
            swarm.take(),
            vec![
                Call::Join(topic, JoinOptions::request()),
                Call::Join(topic, JoinOptions::serve())
            ]
        );

        membership.unserve(topic).await.unwrap();
        assert_eq!(
            swarm.take(),
            vec![Call::Leave(topic), Call::Join(topic, JoinOptions::request())]
        );
        assert!(membership.served_keys().is_empty());
        assert!(membership.requested_keys().contains(&topic));
    }

    #[tokio::test]
    async fn test_request_while_served_is_silent() {
        let (swarm, membership, topic) = setup();

        membership.serve(topic).await.unwrap();
        swarm.take();

        membership.request(topic).await.unwrap();
        membership.unrequest(topic).await.unwrap();
        assert!(swarm.take().is_empty());
        assert!(membership.served_keys().contains(&topic));
    }

    #[tokio::test]
    async fn test_failed_join_reverts_counter() {
        let (swarm, membership, topic) = setup();
        swarm.fail_joins.store(true, Ordering::Relaxed);

        assert!(membership.serve(topic).await.is_err());
        assert!(membership.served_keys().is_empty());
        assert!(membership.all_keys().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (swarm, membership, topic) = setup();

        membership.serve(topic).await.unwrap();
        swarm.take();

        membership.close().await.unwrap();
        membership.close().await.unwrap();
        assert_eq!(swarm.take(), vec![Call::Leave(topic), Call::Destroy]);

        membership.serve(topic).await.unwrap();
        assert!(swarm.take().is_empty());
        assert!(membership.served_keys().is_empty());
    }
}
