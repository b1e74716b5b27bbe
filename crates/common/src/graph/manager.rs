use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

use super::node::GraphNode;
use super::NodeError;
use crate::crypto::{DiscoveryKey, PublicKey};
use crate::events::{EventSink, RehostEvent};
use crate::log::LogStore;
use crate::swarm::SwarmMembership;

/// How a reference wants its node treated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    pub description: Option<String>,
    /// Serve the topic when set, only request it otherwise
    pub announce: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            description: None,
            announce: true,
        }
    }
}

struct NodeEntry<S: LogStore> {
    node: Arc<GraphNode<S>>,
    refs: usize,
}

pub(crate) struct ManagerInner<S: LogStore> {
    logs: S,
    membership: Arc<SwarmMembership>,
    events: EventSink,
    nodes: Mutex<HashMap<PublicKey, NodeEntry<S>>>,
    closing: AtomicBool,
}

impl<S: LogStore> ManagerInner<S> {
    pub(crate) fn logs(&self) -> &S {
        &self.logs
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    pub(crate) fn add_node(
        self: &Arc<Self>,
        key: PublicKey,
        options: NodeOptions,
    ) -> Result<Arc<NodeRef<S>>, NodeError> {
        let node = {
            let mut nodes = self.nodes.lock();
            if self.closing.load(Ordering::Acquire) {
                return Err(NodeError::ManagerClosed);
            }
            let entry = nodes.entry(key).or_insert_with(|| {
                tracing::debug!(key = %key.short(), "tracking new node");
                NodeEntry {
                    node: Arc::new(GraphNode::new(key, Arc::downgrade(self))),
                    refs: 0,
                }
            });
            entry.refs += 1;
            entry.node.clone()
        };

        Ok(Arc::new(NodeRef {
            node,
            manager: Arc::downgrade(self),
            description: Mutex::new(options.description),
            announce: options.announce,
            role: tokio::sync::Mutex::new(Role::Pending),
        }))
    }

    fn ref_count(&self, key: &PublicKey) -> usize {
        self.nodes.lock().get(key).map_or(0, |e| e.refs)
    }

    /// Drop one reference, closing the node when it was the last
    async fn release(&self, node_ref: &NodeRef<S>) -> Result<(), NodeError> {
        let key = node_ref.key();

        let (refs, removed) = {
            let mut nodes = self.nodes.lock();
            // a closing manager closes every node itself
            if self.closing.load(Ordering::Acquire) {
                return Ok(());
            }
            let entry = nodes.get_mut(&key);
            let entry = match entry {
                Some(entry) if Arc::ptr_eq(&entry.node, &node_ref.node) && entry.refs > 0 => entry,
                _ => panic!("released a reference to {} that the manager does not count", key),
            };
            entry.refs -= 1;
            let refs = entry.refs;
            let removed = if refs == 0 {
                nodes.remove(&key).map(|e| e.node)
            } else {
                None
            };
            (refs, removed)
        };

        let result = match removed {
            Some(node) => {
                tracing::debug!(key = %key.short(), "last reference gone, closing node");
                node.close().await
            }
            None => Ok(()),
        };
        self.events.emit(RehostEvent::DeletedNode {
            public_key: key,
            description: node_ref.description(),
            refs,
        });
        result
    }
}

/// Owner of every [`GraphNode`]
///
/// Hands out [`NodeRef`]s and closes a node once its last reference is
/// closed. At most one node exists per key at any time.
#[derive(Clone)]
pub struct NodeManager<S: LogStore> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: LogStore> fmt::Debug for NodeManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeManager")
            .field("nodes", &self.node_count())
            .field("closing", &self.inner.closing.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: LogStore> NodeManager<S> {
    pub fn new(logs: S, membership: Arc<SwarmMembership>, events: EventSink) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                logs,
                membership,
                events,
                nodes: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Take a new reference to `key`, creating its node if it is not tracked.
    ///  Nothing is opened until [`NodeRef::open`].
    pub fn add_node(
        &self,
        key: PublicKey,
        options: NodeOptions,
    ) -> Result<Arc<NodeRef<S>>, NodeError> {
        self.inner.add_node(key, options)
    }

    pub fn ref_count(&self, key: &PublicKey) -> usize {
        self.inner.ref_count(key)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().len()
    }

    pub fn node(&self, key: &PublicKey) -> Option<Arc<GraphNode<S>>> {
        self.inner.nodes.lock().get(key).map(|e| e.node.clone())
    }

    pub fn keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.inner.nodes.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn membership(&self) -> &Arc<SwarmMembership> {
        &self.inner.membership
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    /// Leave the network, then close every node regardless of references.
    ///  The first failure is returned, the rest are emitted as events.
    pub async fn close(&self) -> Result<(), NodeError> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();
        if let Err(err) = self.inner.membership.close().await {
            errors.push(NodeError::Network(err));
        }

        let nodes: Vec<_> = self
            .inner
            .nodes
            .lock()
            .drain()
            .map(|(_, entry)| entry.node)
            .collect();
        tracing::info!(nodes = nodes.len(), "closing node manager");
        for result in future::join_all(nodes.iter().map(|node| node.close())).await {
            if let Err(err) = result {
                errors.push(err);
            }
        }

        let mut errors = errors.into_iter();
        let first = errors.next();
        for err in errors {
            self.inner.events.emit(RehostEvent::Error(err));
        }
        first.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Pending,
    Registered,
    Released,
}

/// One claim on a [`GraphNode`]
///
/// Opening registers the claim's network role (serve or request) and
/// emits `NewNode`. Closing withdraws the role and releases the claim;
/// the node itself closes with its last claim. Both are idempotent.
pub struct NodeRef<S: LogStore> {
    node: Arc<GraphNode<S>>,
    manager: Weak<ManagerInner<S>>,
    description: Mutex<Option<String>>,
    announce: bool,
    role: tokio::sync::Mutex<Role>,
}

impl<S: LogStore> fmt::Debug for NodeRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("key", &self.node.key().short())
            .field("description", &*self.description.lock())
            .field("announce", &self.announce)
            .finish()
    }
}

impl<S: LogStore> NodeRef<S> {
    pub fn key(&self) -> PublicKey {
        self.node.key()
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.node.key().discovery_key()
    }

    pub fn node(&self) -> &Arc<GraphNode<S>> {
        &self.node
    }

    pub fn announce(&self) -> bool {
        self.announce
    }

    pub fn description(&self) -> Option<String> {
        self.description.lock().clone()
    }

    pub fn set_description(&self, description: Option<String>) {
        *self.description.lock() = description;
    }

    pub fn open(self: &Arc<Self>) -> BoxFuture<'static, Result<(), NodeError>> {
        let this = self.clone();
        async move {
            this.node.ready().await?;
            let manager = this.manager.upgrade().ok_or(NodeError::ManagerClosed)?;

            let mut role = this.role.lock().await;
            if *role != Role::Pending {
                return Ok(());
            }
            let topic = this.discovery_key();
            let joined = if this.announce {
                manager.membership.serve(topic).await
            } else {
                manager.membership.request(topic).await
            };
            joined.map_err(|source| NodeError::Membership {
                key: this.key(),
                source,
            })?;
            *role = Role::Registered;
            drop(role);

            manager.events.emit(RehostEvent::NewNode {
                public_key: this.key(),
                description: this.description(),
                refs: manager.ref_count(&this.key()),
            });
            Ok(())
        }
        .boxed()
    }

    pub fn close(self: &Arc<Self>) -> BoxFuture<'static, Result<(), NodeError>> {
        let this = self.clone();
        async move {
            let previous = std::mem::replace(&mut *this.role.lock().await, Role::Released);
            if previous == Role::Released {
                return Ok(());
            }
            let Some(manager) = this.manager.upgrade() else {
                return Ok(());
            };

            let mut result = Ok(());
            if previous == Role::Registered {
                let topic = this.discovery_key();
                let left = if this.announce {
                    manager.membership.unserve(topic).await
                } else {
                    manager.membership.unrequest(topic).await
                };
                result = left.map_err(|source| NodeError::Membership {
                    key: this.key(),
                    source,
                });
            }

            let released = manager.release(&this).await;
            result.and(released)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::crypto::SecretKey;
    use crate::graph::NodeState;
    use crate::log::{LocalLogStore, LogStore, ReplicatedLog};
    use crate::store::{KeyedStore, RehostValue};
    use crate::swarm::MemoryNetwork;
    use crate::testkit::eventually;

    fn manager(logs: &LocalLogStore) -> (NodeManager<LocalLogStore>, MemoryNetwork) {
        let network = MemoryNetwork::new();
        let swarm = Arc::new(network.swarm(logs));
        let membership = Arc::new(SwarmMembership::new(swarm));
        (
            NodeManager::new(logs.clone(), membership, EventSink::default()),
            network,
        )
    }

    #[tokio::test]
    async fn test_shared_node_is_ref_counted() {
        let logs = LocalLogStore::memory();
        let (manager, _network) = manager(&logs);
        let log = logs.create("plain").await.unwrap();
        log.append(Bytes::from("block")).await.unwrap();
        let key = log.key();

        let first = manager.add_node(key, NodeOptions::default()).unwrap();
        let second = manager
            .add_node(
                key,
                NodeOptions {
                    description: Some("again".into()),
                    announce: false,
                },
            )
            .unwrap();
        first.open().await.unwrap();
        second.open().await.unwrap();

        assert_eq!(manager.node_count(), 1);
        assert_eq!(manager.ref_count(&key), 2);
        assert!(Arc::ptr_eq(first.node(), second.node()));
        assert_eq!(first.node().state(), NodeState::Leaf);

        let topic = key.discovery_key();
        assert!(manager.membership().served_keys().contains(&topic));
        assert!(manager.membership().requested_keys().contains(&topic));

        first.close().await.unwrap();
        assert_eq!(manager.ref_count(&key), 1);
        assert!(!manager.membership().served_keys().contains(&topic));
        assert_eq!(first.node().state(), NodeState::Leaf);

        // closing twice releases once
        first.close().await.unwrap();
        assert_eq!(manager.ref_count(&key), 1);

        second.close().await.unwrap();
        assert_eq!(manager.node_count(), 0);
        assert_eq!(second.node().state(), NodeState::Closed);
        assert!(manager.membership().all_keys().is_empty());
    }

    #[tokio::test]
    async fn test_events_report_remaining_refs() {
        let logs = LocalLogStore::memory();
        let (manager, _network) = manager(&logs);
        let mut events = manager.events().subscribe();
        let key = SecretKey::generate().public();

        let a = manager.add_node(key, NodeOptions::default()).unwrap();
        let b = manager.add_node(key, NodeOptions::default()).unwrap();
        a.open().await.unwrap();
        b.open().await.unwrap();
        a.close().await.unwrap();
        b.close().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            match event {
                RehostEvent::NewNode { refs, .. } => seen.push(("new", refs)),
                RehostEvent::DeletedNode { refs, .. } => seen.push(("deleted", refs)),
                _ => {}
            }
        }
        assert_eq!(
            seen,
            vec![("new", 2), ("new", 2), ("deleted", 1), ("deleted", 0)]
        );
    }

    #[tokio::test]
    async fn test_unknown_log_classifies_in_background() {
        let logs = LocalLogStore::memory();
        let (manager, _network) = manager(&logs);
        let key = SecretKey::generate().public();

        let node_ref = manager.add_node(key, NodeOptions::default()).unwrap();
        node_ref.open().await.unwrap();
        assert_eq!(node_ref.node().state(), NodeState::Classifying);

        // closing must not hang on the pending first block
        tokio::time::timeout(Duration::from_secs(5), manager.close())
            .await
            .expect("close hung")
            .unwrap();
        assert_eq!(node_ref.node().state(), NodeState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_child_is_released_before_parent_closes() {
        let logs = LocalLogStore::memory();
        let (manager, _network) = manager(&logs);
        let parent = KeyedStore::open(logs.create("parent").await.unwrap())
            .await
            .unwrap();
        let child = logs.create("child").await.unwrap();
        child.append(Bytes::from("block")).await.unwrap();
        let child_key = child.key();
        parent.add(child_key, RehostValue::default()).await.unwrap();

        let parent_ref = manager
            .add_node(parent.key(), NodeOptions::default())
            .unwrap();
        parent_ref.open().await.unwrap();
        let node = parent_ref.node().clone();
        eventually(Duration::from_secs(5), || {
            let node = node.clone();
            async move { Ok(node.child_keys() == vec![child_key]) }
        })
        .await
        .unwrap();

        parent.delete(&child_key).await.unwrap();
        eventually(Duration::from_secs(5), || {
            let node = node.clone();
            async move { Ok(node.child_keys().is_empty()) }
        })
        .await
        .unwrap();

        // the child's release may still be pending, closing the parent waits for it
        parent_ref.close().await.unwrap();
        assert_eq!(manager.ref_count(&child_key), 0);
        assert_eq!(manager.node_count(), 0);
        assert!(manager.membership().all_keys().is_empty());
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_nodes() {
        let logs = LocalLogStore::memory();
        let (manager, _network) = manager(&logs);
        manager.close().await.unwrap();
        assert_eq!(
            manager
                .add_node(SecretKey::generate().public(), NodeOptions::default())
                .err(),
            Some(NodeError::ManagerClosed)
        );
    }
}
