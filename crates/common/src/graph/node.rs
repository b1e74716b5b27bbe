use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use futures::future;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;

use super::manager::{ManagerInner, NodeOptions, NodeRef};
use super::NodeError;
use crate::crypto::PublicKey;
use crate::events::{EventSink, RehostEvent};
use crate::index::{detect, DiffEntry, KeyedIndex, LogKind, REHOST_SUB_PREFIX};
use crate::log::{DownloadRange, LogEvent, LogStore, ReplicatedLog};
use crate::store::{parse_entry, ScannedEntry};

/// Lifecycle of a [`GraphNode`]. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Created,
    Opening,
    /// Log open, first block not seen yet
    Classifying,
    /// A plain log: replicated, nothing to follow
    Leaf,
    /// A keyed index: its rehost entries are followed
    Indexed,
    Closing,
    Closed,
}

/// One tracked log in the replication graph
pub struct GraphNode<S: LogStore> {
    key: PublicKey,
    manager: Weak<ManagerInner<S>>,
    state: Mutex<NodeState>,
    log: OnceLock<S::Log>,
    children: Mutex<HashMap<PublicKey, Arc<NodeRef<S>>>>,
    secondary: Mutex<Option<Arc<NodeRef<S>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Closes of dropped or replaced children, joined when this node closes
    detached: Mutex<Vec<JoinHandle<()>>>,
    closing: watch::Sender<bool>,
    opened: OnceCell<Result<(), NodeError>>,
    closed: OnceCell<Result<(), NodeError>>,
}

impl<S: LogStore> fmt::Debug for GraphNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("key", &self.key.short())
            .field("state", &*self.state.lock())
            .field("children", &self.children.lock().len())
            .finish()
    }
}

impl<S: LogStore> GraphNode<S> {
    pub(crate) fn new(key: PublicKey, manager: Weak<ManagerInner<S>>) -> Self {
        Self {
            key,
            manager,
            state: Mutex::new(NodeState::Created),
            log: OnceLock::new(),
            children: Mutex::new(HashMap::new()),
            secondary: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            closing: watch::Sender::new(false),
            opened: OnceCell::new(),
            closed: OnceCell::new(),
        }
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn log(&self) -> Option<&S::Log> {
        self.log.get()
    }

    pub fn child_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.children.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn secondary_key(&self) -> Option<PublicKey> {
        self.secondary.lock().as_ref().map(|s| s.key())
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Open the node once. Every caller waits for the same attempt.
    ///
    /// Returns as soon as the log is open and downloading: a log whose
    ///  first block is not available yet keeps classifying in the
    ///  background.
    pub async fn ready(self: &Arc<Self>) -> Result<(), NodeError> {
        self.opened
            .get_or_init(|| self.open_inner())
            .await
            .clone()
    }

    async fn open_inner(self: &Arc<Self>) -> Result<(), NodeError> {
        if !self.advance(NodeState::Opening) {
            return Ok(());
        }
        let manager = self.manager()?;

        let log = manager
            .logs()
            .open(self.key)
            .await
            .map_err(|source| NodeError::Open {
                key: self.key,
                source,
            })?;
        let _ = self.log.set(log.clone());

        self.spawn_tracked(forward_log_events(
            self.key,
            log.clone(),
            log.subscribe(),
            manager.events().clone(),
            self.closing.subscribe(),
        ));
        log.download(DownloadRange::full())
            .map_err(|source| NodeError::Open {
                key: self.key,
                source,
            })?;

        if !self.advance(NodeState::Classifying) {
            return Ok(());
        }
        if !self.classify(false).await? {
            tracing::debug!(key = %self.key.short(), "first block not available, classifying in background");
            let node = self.clone();
            self.spawn_tracked(async move {
                if let Err(err) = node.classify(true).await {
                    node.emit_error(err);
                }
            });
        }
        Ok(())
    }

    /// Returns whether classification concluded, one way or another
    async fn classify(self: &Arc<Self>, wait: bool) -> Result<bool, NodeError> {
        let Some(log) = self.log.get().cloned() else {
            return Ok(true);
        };
        let kind = match self.until_closing(detect(&log, wait)).await {
            None => return Ok(true),
            Some(Err(_)) if self.is_closing() => return Ok(true),
            Some(Err(source)) => {
                return Err(NodeError::Open {
                    key: self.key,
                    source,
                })
            }
            Some(Ok(None)) => return Ok(false),
            Some(Ok(Some(kind))) => kind,
        };

        match kind {
            LogKind::Plain => {
                self.advance(NodeState::Leaf);
                tracing::debug!(key = %self.key.short(), "plain log");
            }
            LogKind::Indexed => {
                if self.advance(NodeState::Indexed) {
                    tracing::debug!(key = %self.key.short(), "keyed index, following its entries");
                    self.follow(KeyedIndex::new(log)).await?;
                }
            }
        }
        Ok(true)
    }

    async fn follow(self: &Arc<Self>, index: KeyedIndex<S::Log>) -> Result<(), NodeError> {
        let header = index
            .header(false)
            .await
            .map_err(|source| NodeError::Index {
                key: self.key,
                source,
            })?;

        match header.as_ref().and_then(|h| h.metadata.content_feed()) {
            Some(Ok(feed)) if feed != self.key => self.add_secondary(feed)?,
            Some(Err(err)) => {
                tracing::warn!(key = %self.key.short(), %err, "ignoring malformed content feed");
            }
            _ => {}
        }

        self.spawn_tracked(watch_entries(self.clone(), index));
        Ok(())
    }

    fn add_secondary(self: &Arc<Self>, feed: PublicKey) -> Result<(), NodeError> {
        if self.is_closing() {
            return Ok(());
        }
        let secondary = self.manager()?.add_node(
            feed,
            NodeOptions {
                description: Some(format!("Secondary log of {}", self.key)),
                announce: false,
            },
        )?;
        *self.secondary.lock() = Some(secondary.clone());

        // the content log may itself lead back here, so never wait on it
        let node = self.clone();
        self.spawn_tracked(async move {
            if let Err(err) = secondary.open().await {
                node.emit_error(err);
            }
        });
        Ok(())
    }

    /// Apply one changed rehost entry of this node's index
    async fn consume(self: &Arc<Self>, diff: DiffEntry) {
        let Some(events) = self.manager.upgrade().map(|m| m.events().clone()) else {
            return;
        };

        let added = match diff.left {
            Some(left) => match parse_entry(&left.key, &left.value) {
                ScannedEntry::Valid { key, entry } => Some((key, entry)),
                ScannedEntry::InvalidKey { raw_key } => {
                    tracing::warn!(parent = %self.key.short(), key = %hex::encode(&raw_key), "invalid key in rehost entries");
                    events.emit(RehostEvent::InvalidKey {
                        invalid_key: raw_key,
                        parent: self.key,
                    });
                    return;
                }
                ScannedEntry::InvalidValue { key, error, .. } => {
                    tracing::warn!(parent = %self.key.short(), key = %key.short(), %error, "invalid rehost entry");
                    events.emit(RehostEvent::InvalidValue {
                        parent: self.key,
                        key,
                        error,
                    });
                    // the entry it replaced no longer stands
                    if diff.right.is_some() {
                        self.drop_child(&key);
                    }
                    return;
                }
            },
            None => None,
        };
        let removed = diff
            .right
            .and_then(|right| PublicKey::try_from(&right.key[..]).ok());

        match (added, removed) {
            (Some((key, entry)), None) => self.add_child(key, entry.description).await,
            (None, Some(key)) => self.drop_child(&key),
            (Some((key, entry)), Some(_)) => {
                let existing = self.children.lock().get(&key).cloned();
                match existing {
                    Some(child) => child.set_description(entry.description),
                    None => self.add_child(key, entry.description).await,
                }
            }
            (None, None) => {}
        }
    }

    async fn add_child(self: &Arc<Self>, key: PublicKey, description: Option<String>) {
        if self.is_closing() {
            return;
        }
        let Ok(manager) = self.manager() else {
            return;
        };
        let child = match manager.add_node(
            key,
            NodeOptions {
                description,
                announce: true,
            },
        ) {
            Ok(child) => child,
            Err(err) => {
                tracing::debug!(key = %key.short(), %err, "not adding child");
                return;
            }
        };

        let previous = self.children.lock().insert(key, child.clone());
        if let Some(previous) = previous {
            self.close_detached(previous);
        }
        if let Err(err) = child.open().await {
            self.emit_error(err);
        }
    }

    fn drop_child(self: &Arc<Self>, key: &PublicKey) {
        let child = self.children.lock().remove(key);
        if let Some(child) = child {
            self.close_detached(child);
        }
    }

    /// Release `child` without waiting for it. Runs even while closing: the
    ///  child is already out of `children`.
    fn close_detached(self: &Arc<Self>, child: Arc<NodeRef<S>>) {
        let node = self.clone();
        let mut detached = self.detached.lock();
        detached.retain(|t| !t.is_finished());
        detached.push(tokio::spawn(async move {
            if let Err(err) = child.close().await {
                node.emit_error(err);
            }
        }));
    }

    /// Close once: stop background work, release the secondary and every
    ///  child, then close the log session.
    pub async fn close(self: &Arc<Self>) -> Result<(), NodeError> {
        self.closed.get_or_init(|| self.close_inner()).await.clone()
    }

    async fn close_inner(self: &Arc<Self>) -> Result<(), NodeError> {
        self.closing.send_replace(true);
        self.advance(NodeState::Closing);

        // an open in flight finishes first; one never started becomes a no-op
        let _ = self.ready().await;

        join_all_tracked(&self.tasks).await;
        // background work is over, so no more children get detached
        join_all_tracked(&self.detached).await;

        let secondary = self.secondary.lock().take();
        let children: Vec<_> = self.children.lock().drain().map(|(_, c)| c).collect();
        let mut errors: Vec<NodeError> = future::join_all(
            secondary
                .into_iter()
                .chain(children)
                .map(|child| child.close()),
        )
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if let Some(log) = self.log.get() {
            if let Err(source) = log.close().await {
                errors.push(NodeError::Close {
                    key: self.key,
                    source,
                });
            }
        }
        *self.state.lock() = NodeState::Closed;
        tracing::debug!(key = %self.key.short(), "node closed");

        let mut errors = errors.into_iter();
        let first = errors.next();
        for err in errors {
            self.emit_error(err);
        }
        first.map_or(Ok(()), Err)
    }

    /// Move to `next` unless the node is already past it or closing
    fn advance(&self, next: NodeState) -> bool {
        let mut state = self.state.lock();
        if *state >= next {
            return false;
        }
        *state = next;
        true
    }

    fn manager(&self) -> Result<Arc<ManagerInner<S>>, NodeError> {
        self.manager.upgrade().ok_or(NodeError::ManagerClosed)
    }

    fn emit_error(&self, err: NodeError) {
        tracing::warn!(key = %self.key.short(), %err, "node error");
        if let Some(manager) = self.manager.upgrade() {
            manager.events().emit(RehostEvent::Error(err));
        }
    }

    /// Run `task` until it ends or this node closes.
    ///  Nothing is spawned once closing has begun.
    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.is_closing() {
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(task));
    }

    async fn until_closing<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        let mut closing = self.closing.subscribe();
        tokio::select! {
            value = fut => Some(value),
            _ = closing.wait_for(|c| *c) => None,
        }
    }
}

/// Await every handle in `tasks`, including ones pushed meanwhile
async fn join_all_tracked(tasks: &Mutex<Vec<JoinHandle<()>>>) {
    loop {
        let batch = std::mem::take(&mut *tasks.lock());
        if batch.is_empty() {
            return;
        }
        for task in batch {
            if let Err(err) = task.await {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        }
    }
}

async fn forward_log_events<L: ReplicatedLog>(
    key: PublicKey,
    log: L,
    mut log_events: broadcast::Receiver<LogEvent>,
    events: EventSink,
    mut closing: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = log_events.recv() => event,
            _ = closing.wait_for(|c| *c) => break,
        };
        match event {
            Ok(LogEvent::Append { length }) => events.emit(RehostEvent::NodeUpdate {
                public_key: key,
                length,
            }),
            Ok(LogEvent::Download { .. }) => {
                let length = log.length();
                if log.contiguous_length() >= length {
                    events.emit(RehostEvent::NodeFullyDownloaded {
                        public_key: key,
                        length,
                    });
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(key = %key.short(), skipped, "log events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Follow the rehost entries of an index for as long as its node is open.
///  Version bumps that arrive while a diff is applied coalesce into the next one.
async fn watch_entries<S: LogStore>(node: Arc<GraphNode<S>>, index: KeyedIndex<S::Log>) {
    let mut versions = index.watch();
    let mut closing = node.closing.subscribe();
    // version 1 holds only the header
    let mut applied = 1;

    loop {
        let current = *versions.borrow_and_update();
        if current > applied {
            match index.diff(applied, current, REHOST_SUB_PREFIX).await {
                Ok(changes) => {
                    for change in changes {
                        if node.is_closing() {
                            return;
                        }
                        node.consume(change).await;
                    }
                    applied = current;
                }
                Err(_) if node.is_closing() => return,
                Err(source) => {
                    node.emit_error(NodeError::Index {
                        key: node.key,
                        source,
                    });
                    return;
                }
            }
        }

        tokio::select! {
            changed = versions.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = closing.wait_for(|c| *c) => return,
        }
    }
}
