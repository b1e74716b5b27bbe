use bytes::Bytes;
use tokio::sync::broadcast;

use crate::crypto::PublicKey;
use crate::graph::NodeError;
use crate::store::EncodingError;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Everything a rehoster reports while it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RehostEvent {
    /// A node reference finished opening. `refs` counts every
    ///  reference to the same key at that moment.
    NewNode {
        public_key: PublicKey,
        description: Option<String>,
        refs: usize,
    },
    /// A node reference was closed. `refs` is what remains: zero
    ///  means the node itself is gone.
    DeletedNode {
        public_key: PublicKey,
        description: Option<String>,
        refs: usize,
    },
    NodeUpdate {
        public_key: PublicKey,
        length: u64,
    },
    NodeFullyDownloaded {
        public_key: PublicKey,
        length: u64,
    },
    /// An index listed something that is not a public key
    InvalidKey {
        invalid_key: Bytes,
        parent: PublicKey,
    },
    /// An index listed a key with an undecodable entry
    InvalidValue {
        parent: PublicKey,
        key: PublicKey,
        error: EncodingError,
    },
    Synced {
        entries: usize,
    },
    Error(NodeError),
}

/// Broadcast side of the event stream.
///  Emitting never fails, listeners or not.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<RehostEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: RehostEvent) {
        tracing::trace!(?event, "rehost event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RehostEvent> {
        self.tx.subscribe()
    }
}
