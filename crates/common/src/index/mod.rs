//! Ordered key-value index over a replicated log
//!
//! Block 0 of an indexed log is a header: a magic prefix followed by a
//! bincode [`Header`]. Every later block is one bincode-encoded put or delete.
//! The index's version is the number of blocks held locally, so the state at
//! any version is a replay of blocks `1..version`, and two versions can be
//! diffed to learn what changed in between.
//!
//! Keys can be scoped under a byte prefix. The rehost set of a log lives
//! under [`REHOST_SUB_PREFIX`], which lets any index (a drive, say) carry one
//! alongside its own entries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::crypto::{KeyError, PublicKey, PUBLIC_KEY_SIZE};
use crate::log::{LogError, ReplicatedLog};

/// Leading bytes of a header block
pub const INDEX_MAGIC: &[u8; 4] = b"\x00RIX";
pub const INDEX_PROTOCOL: &str = "keyed-index/1";
/// Namespace holding rehost entries
pub const REHOST_SUB_PREFIX: &[u8] = b"rehoster-data\x00";
/// `user_data` marking an index as a rehoster's own store
pub const REHOSTER_MARKER: &[u8] = b"rehoster";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("log {0} is not a keyed index")]
    NotIndexed(PublicKey),
    #[error("corrupt block {index} in {key}: {reason}")]
    Corrupt {
        key: PublicKey,
        index: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Companion log holding the index's bulk content
    pub content_feed: Option<[u8; PUBLIC_KEY_SIZE]>,
    pub user_data: Option<Vec<u8>>,
}

impl Metadata {
    pub fn content_feed(&self) -> Option<Result<PublicKey, KeyError>> {
        self.content_feed
            .as_ref()
            .map(|bytes| PublicKey::try_from(&bytes[..]))
    }

    pub fn is_rehoster(&self) -> bool {
        self.user_data.as_deref() == Some(REHOSTER_MARKER)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub protocol: String,
    pub metadata: Metadata,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            protocol: INDEX_PROTOCOL.to_string(),
            metadata: Metadata::default(),
        }
    }
}

impl Header {
    pub fn rehoster() -> Self {
        Self {
            metadata: Metadata {
                content_feed: None,
                user_data: Some(REHOSTER_MARKER.to_vec()),
            },
            ..Default::default()
        }
    }

    pub fn with_content_feed(content_feed: PublicKey) -> Self {
        Self {
            metadata: Metadata {
                content_feed: Some(content_feed.to_bytes()),
                user_data: None,
            },
            ..Default::default()
        }
    }

    fn encode(&self) -> Bytes {
        let mut block = INDEX_MAGIC.to_vec();
        // serializing a plain struct into a Vec cannot fail
        block.extend(bincode::serialize(self).unwrap_or_default());
        block.into()
    }

    fn decode(block: &[u8]) -> Option<Self> {
        let body = block.strip_prefix(&INDEX_MAGIC[..])?;
        bincode::deserialize(body).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Op {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

/// What a log turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Plain,
    Indexed,
}

/// Classify a log by its first block.
///  Without `wait`, an empty log is inconclusive and yields `None`.
pub async fn detect<L: ReplicatedLog>(log: &L, wait: bool) -> Result<Option<LogKind>, LogError> {
    Ok(log.get(0, wait).await?.map(|block| {
        if Header::decode(&block).is_some() {
            LogKind::Indexed
        } else {
            LogKind::Plain
        }
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
}

/// One changed key between two versions.
///  `left` is the newer entry, `right` the older one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub left: Option<Entry>,
    pub right: Option<Entry>,
}

type Snapshot = BTreeMap<Bytes, Bytes>;

#[derive(Debug)]
struct IndexInner {
    /// Latest materialized state and the version it reflects
    latest: Mutex<(u64, Arc<Snapshot>)>,
    header: Mutex<Option<Header>>,
    write: tokio::sync::Mutex<()>,
}

/// Keyed index over a log session
#[derive(Debug, Clone)]
pub struct KeyedIndex<L> {
    log: L,
    inner: Arc<IndexInner>,
}

impl<L: ReplicatedLog> KeyedIndex<L> {
    pub fn new(log: L) -> Self {
        Self {
            log,
            inner: Arc::new(IndexInner {
                latest: Mutex::new((1, Arc::new(Snapshot::new()))),
                header: Mutex::new(None),
                write: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn version(&self) -> u64 {
        self.log.contiguous_length()
    }

    /// Watch the version as blocks arrive
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.log.watch_length()
    }

    /// Read the header, waiting for block 0 if `wait` is set
    pub async fn header(&self, wait: bool) -> Result<Option<Header>, IndexError> {
        if let Some(header) = self.inner.header.lock().clone() {
            return Ok(Some(header));
        }
        let Some(block) = self.log.get(0, wait).await? else {
            return Ok(None);
        };
        let header = Header::decode(&block).ok_or(IndexError::NotIndexed(self.log.key()))?;
        *self.inner.header.lock() = Some(header.clone());
        Ok(Some(header))
    }

    /// Write `header` if the log is still empty. Returns whether it was written.
    pub async fn init_header(&self, header: Header) -> Result<bool, IndexError> {
        let _write = self.inner.write.lock().await;
        self.init_header_locked(header).await
    }

    async fn init_header_locked(&self, header: Header) -> Result<bool, IndexError> {
        if self.log.length() > 0 {
            return Ok(false);
        }
        self.log.append(header.encode()).await?;
        *self.inner.header.lock() = Some(header);
        Ok(true)
    }

    async fn snapshot(&self, version: u64) -> Result<Arc<Snapshot>, IndexError> {
        let version = version.min(self.version());
        let (cached_version, cached) = {
            let latest = self.inner.latest.lock();
            (latest.0, latest.1.clone())
        };
        if version == cached_version {
            return Ok(cached);
        }

        let (mut at, mut state) = if version > cached_version {
            (cached_version, (*cached).clone())
        } else {
            (1, Snapshot::new())
        };
        while at < version {
            let block = self
                .log
                .get(at, false)
                .await?
                .ok_or_else(|| self.corrupt(at, "block missing below version"))?;
            let op: Op = bincode::deserialize(&block)
                .map_err(|e| self.corrupt(at, &format!("bad operation: {}", e)))?;
            match op {
                Op::Put { key, value } => {
                    state.insert(key.into(), value.into());
                }
                Op::Del { key } => {
                    state.remove(&key[..]);
                }
            }
            at += 1;
        }

        let state = Arc::new(state);
        let mut latest = self.inner.latest.lock();
        if latest.0 < version {
            *latest = (version, state.clone());
        }
        Ok(state)
    }

    fn corrupt(&self, index: u64, reason: &str) -> IndexError {
        IndexError::Corrupt {
            key: self.log.key(),
            index,
            reason: reason.to_string(),
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, IndexError> {
        let state = self.snapshot(self.version()).await?;
        Ok(state.get(key).cloned())
    }

    /// Put `value` under `key`. When an entry exists and `cas` is given,
    ///  the write only happens if `cas(previous, value)` returns true.
    ///  Returns whether a block was written.
    pub async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        cas: Option<&(dyn Fn(&[u8], &[u8]) -> bool + Send + Sync)>,
    ) -> Result<bool, IndexError> {
        if !self.log.writable() {
            return Err(LogError::NotWritable(self.log.key()).into());
        }
        let _write = self.inner.write.lock().await;
        self.init_header_locked(Header::default()).await?;

        let state = self.snapshot(self.version()).await?;
        if let (Some(previous), Some(cas)) = (state.get(key), cas) {
            if !cas(previous, value) {
                return Ok(false);
            }
        }

        let op = Op::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.append_op(&op).await?;
        Ok(true)
    }

    /// Delete `key`. Nothing is written when it is absent.
    pub async fn del(&self, key: &[u8]) -> Result<bool, IndexError> {
        if !self.log.writable() {
            return Err(LogError::NotWritable(self.log.key()).into());
        }
        let _write = self.inner.write.lock().await;

        let state = self.snapshot(self.version()).await?;
        if !state.contains_key(key) {
            return Ok(false);
        }
        self.append_op(&Op::Del { key: key.to_vec() }).await?;
        Ok(true)
    }

    async fn append_op(&self, op: &Op) -> Result<(), IndexError> {
        let block = bincode::serialize(op)
            .map_err(|e| self.corrupt(self.log.length(), &e.to_string()))?;
        self.log.append(block.into()).await?;
        Ok(())
    }

    /// Entries under `prefix` at the current version, prefix stripped, in key order
    pub async fn entries(&self, prefix: &[u8]) -> Result<Vec<Entry>, IndexError> {
        let state = self.snapshot(self.version()).await?;
        Ok(scoped(&state, prefix)
            .map(|(key, value)| Entry {
                key,
                value: value.clone(),
            })
            .collect())
    }

    /// Changes under `prefix` between two versions, prefix stripped, in key order
    pub async fn diff(
        &self,
        from: u64,
        to: u64,
        prefix: &[u8],
    ) -> Result<Vec<DiffEntry>, IndexError> {
        let older = self.snapshot(from).await?;
        let newer = self.snapshot(to).await?;

        let older_scoped: BTreeMap<_, _> = scoped(&older, prefix).collect();
        let newer_scoped: BTreeMap<_, _> = scoped(&newer, prefix).collect();
        let keys: BTreeSet<&Bytes> = older_scoped.keys().chain(newer_scoped.keys()).collect();

        let mut diff = Vec::new();
        for key in keys {
            let old = older_scoped.get(key).copied();
            let new = newer_scoped.get(key).copied();
            if old == new {
                continue;
            }
            let entry = |value: &Bytes| Entry {
                key: key.clone(),
                value: value.clone(),
            };
            diff.push(DiffEntry {
                left: new.map(entry),
                right: old.map(entry),
            });
        }
        Ok(diff)
    }
}

/// Entries of `state` under `prefix`, keys stripped of it
fn scoped<'a>(state: &'a Snapshot, prefix: &'a [u8]) -> impl Iterator<Item = (Bytes, &'a Bytes)> + 'a {
    state
        .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
        .map(move |(key, value)| (key.slice(prefix.len()..), value))
}

/// Prefix `key` with a sub-namespace
pub fn sub_key(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut scoped = Vec::with_capacity(prefix.len() + key.len());
    scoped.extend_from_slice(prefix);
    scoped.extend_from_slice(key);
    scoped
}
