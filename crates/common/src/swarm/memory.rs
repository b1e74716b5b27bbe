//! In-process overlay network
//!
//! Peers register a [`LocalLogStore`] with a shared [`MemoryNetwork`] and get
//! back a [`MemorySwarm`]. Two peers on the same topic are connected when at
//! least one of them is a server and the other a client. Connected peers
//! replicate every log under that topic from the longer copy to the shorter
//! one, as far as the receiving copy wants.
//!
//! Replication runs on a single background worker fed by a flume job queue,
//! the same shape as a peer's job dispatcher: anything that changes a topic
//! (a join, an append, new demand) enqueues it, and the worker coalesces
//! queued topics before each pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{JoinOptions, Swarm, SwarmError};
use crate::crypto::DiscoveryKey;
use crate::log::LocalLogStore;

/// Background jobs for the replication worker
#[derive(Debug, Clone, Copy)]
enum Job {
    /// Bring every connected copy of the topic's logs up to date
    Replicate(DiscoveryKey),
}

#[derive(Debug)]
struct PeerSlot {
    store: LocalLogStore,
    topics: HashMap<DiscoveryKey, JoinOptions>,
}

#[derive(Debug)]
struct NetworkInner {
    peers: Mutex<HashMap<u64, PeerSlot>>,
    next_id: AtomicU64,
    jobs: flume::Sender<Job>,
}

impl NetworkInner {
    fn dispatch(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            tracing::warn!("replication worker has stopped");
        }
    }
}

/// Shared in-process network
///
/// Must be created inside a tokio runtime: it spawns its replication worker
/// on construction. The worker stops once the network is dropped.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        let inner = Arc::new(NetworkInner {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            jobs: tx,
        });
        tokio::spawn(run_worker(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    /// Attach a peer's log store to the network
    pub fn swarm(&self, store: &LocalLogStore) -> MemorySwarm {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.peers.lock().insert(
            id,
            PeerSlot {
                store: store.clone(),
                topics: HashMap::new(),
            },
        );

        let jobs = self.inner.jobs.clone();
        store.set_notifier(Arc::new(move |topic| {
            let _ = jobs.send(Job::Replicate(topic));
        }));

        MemorySwarm {
            id,
            network: self.clone(),
        }
    }

    /// Number of peers currently attached
    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }
}

async fn run_worker(network: Weak<NetworkInner>, rx: flume::Receiver<Job>) {
    while let Ok(job) = rx.recv_async().await {
        let mut topics = BTreeSet::new();
        let Job::Replicate(topic) = job;
        topics.insert(topic);
        while let Ok(Job::Replicate(topic)) = rx.try_recv() {
            topics.insert(topic);
        }

        let Some(network) = network.upgrade() else {
            break;
        };
        for topic in topics {
            replicate_topic(&network, topic).await;
        }
    }
    tracing::debug!("replication worker exiting");
}

fn connected(a: &JoinOptions, b: &JoinOptions) -> bool {
    (a.server && b.client) || (a.client && b.server)
}

async fn replicate_topic(network: &NetworkInner, topic: DiscoveryKey) {
    let members: Vec<(LocalLogStore, JoinOptions)> = network
        .peers
        .lock()
        .values()
        .filter_map(|peer| peer.topics.get(&topic).map(|opts| (peer.store.clone(), *opts)))
        .collect();

    for (i, (source, source_opts)) in members.iter().enumerate() {
        for (j, (sink, sink_opts)) in members.iter().enumerate() {
            if i == j || !connected(source_opts, sink_opts) {
                continue;
            }
            for from in source.cores_for(&topic) {
                let Some(to) = sink.core_for(&from.key()) else {
                    continue;
                };

                let have = from.contiguous_length();
                to.learn_length(have);

                let held = to.contiguous_length();
                let until = to.demand().min(have);
                if until <= held {
                    continue;
                }

                let blocks = from.blocks(held, until);
                match to.receive(held, blocks).await {
                    Ok(received) => tracing::trace!(
                        log = %from.key().short(),
                        received,
                        "replicated blocks"
                    ),
                    Err(e) => tracing::warn!(
                        log = %from.key().short(),
                        "failed to store replicated blocks: {}",
                        e
                    ),
                }
            }
        }
    }
}

/// One peer's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemorySwarm {
    id: u64,
    network: MemoryNetwork,
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn join(&self, topic: DiscoveryKey, opts: JoinOptions) -> Result<(), SwarmError> {
        {
            let mut peers = self.network.inner.peers.lock();
            let peer = peers.get_mut(&self.id).ok_or(SwarmError::Destroyed)?;
            peer.topics.insert(topic, opts);
        }
        self.network.inner.dispatch(Job::Replicate(topic));
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryKey) -> Result<(), SwarmError> {
        let mut peers = self.network.inner.peers.lock();
        let peer = peers.get_mut(&self.id).ok_or(SwarmError::Destroyed)?;
        peer.topics.remove(&topic);
        Ok(())
    }

    fn topics(&self) -> Vec<(DiscoveryKey, JoinOptions)> {
        self.network
            .inner
            .peers
            .lock()
            .get(&self.id)
            .map(|peer| peer.topics.iter().map(|(t, o)| (*t, *o)).collect())
            .unwrap_or_default()
    }

    async fn destroy(&self) -> Result<(), SwarmError> {
        self.network.inner.peers.lock().remove(&self.id);
        Ok(())
    }
}
