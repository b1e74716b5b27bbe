use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, OnceCell};

use crate::crypto::{DiscoveryKey, PublicKey};
use crate::events::{EventSink, RehostEvent};
use crate::graph::{NodeError, NodeManager, NodeOptions, NodeRef};
use crate::log::{LogError, LogStore};
use crate::store::{
    DesiredState, KeyedStore, RehostEntry, RehostValue, ScannedEntry, StoreError, SyncOutcome,
};
use crate::swarm::{Swarm, SwarmMembership};

pub const DEFAULT_INDEX_NAME: &str = "rehoster-bee";
pub const ROOT_DESCRIPTION: &str = "The rehoster itself";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehosterConfig {
    /// Name of the writable log holding the rehost set
    pub index_name: String,
}

impl Default for RehosterConfig {
    fn default() -> Self {
        Self {
            index_name: DEFAULT_INDEX_NAME.to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RehosterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Log(#[from] LogError),
}

/// A rehoster: a durable set of public keys, and the replication graph
/// growing out of it
///
/// Every key in the set is replicated and announced. Keys that turn out
/// to be rehosters are followed recursively; drives pull in their content
/// log as a requested, unannounced secondary.
pub struct Rehoster<S: LogStore> {
    store: KeyedStore<S::Log>,
    manager: NodeManager<S>,
    root: Arc<NodeRef<S>>,
    events: EventSink,
    closed: OnceCell<Result<(), RehosterError>>,
}

impl<S: LogStore> fmt::Debug for Rehoster<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rehoster")
            .field("key", &self.own_key().short())
            .field("manager", &self.manager)
            .finish()
    }
}

impl<S: LogStore> Rehoster<S> {
    pub async fn open(
        logs: S,
        swarm: Arc<dyn Swarm>,
        config: RehosterConfig,
    ) -> Result<Self, RehosterError> {
        Self::open_with_events(logs, swarm, config, EventSink::default()).await
    }

    /// Open with a caller-provided sink, so events emitted while the root
    ///  opens are not missed
    pub async fn open_with_events(
        logs: S,
        swarm: Arc<dyn Swarm>,
        config: RehosterConfig,
        events: EventSink,
    ) -> Result<Self, RehosterError> {
        let log = logs.create(&config.index_name).await?;
        let store = KeyedStore::open(log).await?;

        let membership = Arc::new(SwarmMembership::new(swarm));
        let manager = NodeManager::new(logs, membership, events.clone());
        let root = manager.add_node(
            store.key(),
            NodeOptions {
                description: Some(ROOT_DESCRIPTION.to_string()),
                announce: true,
            },
        )?;
        root.open().await?;

        tracing::info!(key = %store.key(), "rehoster open");
        Ok(Self {
            store,
            manager,
            root,
            events,
            closed: OnceCell::new(),
        })
    }

    pub fn own_key(&self) -> PublicKey {
        self.store.key()
    }

    pub fn own_discovery_key(&self) -> DiscoveryKey {
        self.store.key().discovery_key()
    }

    pub fn store(&self) -> &KeyedStore<S::Log> {
        &self.store
    }

    pub fn manager(&self) -> &NodeManager<S> {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RehostEvent> {
        self.events.subscribe()
    }

    pub async fn add(&self, key: PublicKey, value: RehostValue) -> Result<bool, RehosterError> {
        Ok(self.store.add(key, value).await?)
    }

    pub async fn delete(&self, key: &PublicKey) -> Result<bool, RehosterError> {
        Ok(self.store.delete(key).await?)
    }

    pub async fn get(&self, key: &PublicKey) -> Result<Option<RehostEntry>, RehosterError> {
        Ok(self.store.get(key).await?)
    }

    pub async fn has(&self, key: &PublicKey) -> Result<bool, RehosterError> {
        Ok(self.store.has(key).await?)
    }

    /// Replace the rehost set with `desired`. Emits `Synced` when this
    ///  call's set is the one applied.
    pub async fn sync(&self, desired: DesiredState) -> Result<SyncOutcome, RehosterError> {
        let entries = desired.len();
        let outcome = self.store.sync(desired).await?;
        if outcome == SyncOutcome::Applied {
            self.events.emit(RehostEvent::Synced { entries });
        }
        Ok(outcome)
    }

    /// Valid entries of the rehost set. Invalid ones are reported as events.
    pub async fn entries(&self) -> Result<Vec<(PublicKey, RehostEntry)>, RehosterError> {
        let parent = self.own_key();
        let mut valid = Vec::new();
        for scanned in self.store.scan().await? {
            match scanned {
                ScannedEntry::Valid { key, entry } => valid.push((key, entry)),
                ScannedEntry::InvalidKey { raw_key } => {
                    self.events.emit(RehostEvent::InvalidKey {
                        invalid_key: raw_key,
                        parent,
                    })
                }
                ScannedEntry::InvalidValue { key, error, .. } => {
                    self.events
                        .emit(RehostEvent::InvalidValue { parent, key, error })
                }
            }
        }
        Ok(valid)
    }

    /// Topics currently announced
    pub fn served_keys(&self) -> BTreeSet<DiscoveryKey> {
        self.manager.membership().served_keys()
    }

    /// Topics some node replicates without announcing
    pub fn requested_keys(&self) -> BTreeSet<DiscoveryKey> {
        self.manager.membership().requested_keys()
    }

    /// Every topic joined, served or requested
    pub fn keys(&self) -> BTreeSet<DiscoveryKey> {
        self.manager.membership().all_keys()
    }

    /// Close the root, then the whole graph and the network
    pub async fn close(&self) -> Result<(), RehosterError> {
        self.closed
            .get_or_init(|| async {
                let root = self.root.close().await;
                let manager = self.manager.close().await;
                let store = self.store.close().await;
                tracing::info!(key = %self.own_key(), "rehoster closed");
                root.map_err(RehosterError::from)
                    .and(manager.map_err(RehosterError::from))
                    .and(store.map_err(RehosterError::from))
            })
            .await
            .clone()
    }
}
