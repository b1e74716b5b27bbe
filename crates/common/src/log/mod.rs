//! Replicated append-only logs
//!
//! A log is a sequence of binary blocks addressed by the public key of its
//! author. Peers that only hold a prefix of the log learn the remote length
//! first and fetch blocks on demand, so `length` (what is known to exist) can
//! run ahead of `contiguous_length` (what is held locally).

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::crypto::{DiscoveryKey, PublicKey};

mod memory;

pub use memory::{LocalLog, LocalLogStore};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("log {0} is closed")]
    Closed(PublicKey),
    #[error("log {0} is not writable")]
    NotWritable(PublicKey),
    #[error("log store is closed")]
    StoreClosed,
    #[error("log io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}

/// Progress notifications for a single log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// The known length of the log grew, either through a
    ///  local append or because a peer advertised more blocks
    Append { length: u64 },
    /// A block was received from a peer
    Download { index: u64 },
}

/// Range of blocks to keep downloading.
///  An open end means "everything, including future appends".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl DownloadRange {
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }
}

/// A session on a replicated log
///
/// Cloning a handle shares the session: closing any clone closes them all.
/// Sessions opened separately on the same key are independent.
#[async_trait]
pub trait ReplicatedLog: Send + Sync + Debug + Clone + 'static {
    fn key(&self) -> PublicKey;

    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// Whether this session can append
    fn writable(&self) -> bool;

    /// Number of blocks known to exist
    fn length(&self) -> u64;

    /// Number of blocks held locally, starting from block 0
    fn contiguous_length(&self) -> u64;

    /// Read a block. With `wait`, registers demand for it and resolves
    ///  once it has been replicated; without, returns `None` when it is
    ///  not held locally.
    async fn get(&self, index: u64, wait: bool) -> Result<Option<Bytes>, LogError>;

    /// Append a block, returning the new length
    async fn append(&self, block: Bytes) -> Result<u64, LogError>;

    /// Register continuous demand for a range of blocks
    fn download(&self, range: DownloadRange) -> Result<(), LogError>;

    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Watch the locally held length
    fn watch_length(&self) -> watch::Receiver<u64>;

    fn is_closed(&self) -> bool;

    /// Close this session. Pending waits resolve with `LogError::Closed`.
    async fn close(&self) -> Result<(), LogError>;
}

/// Opens sessions on logs by key
#[async_trait]
pub trait LogStore: Send + Sync + Debug + Clone + 'static {
    type Log: ReplicatedLog;

    /// Open a session on the log with the given key.
    ///  Unknown keys open empty, read-only logs that fill as peers replicate.
    async fn open(&self, key: PublicKey) -> Result<Self::Log, LogError>;

    /// Open a writable log whose keypair is derived from the
    ///  store's seed and `name`. The same name always yields the same key.
    async fn create(&self, name: &str) -> Result<Self::Log, LogError>;

    async fn close(&self) -> Result<(), LogError>;
}
