use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};

use super::{DownloadRange, LogError, LogEvent, LogStore, ReplicatedLog};
use crate::crypto::{DiscoveryKey, PublicKey, SecretKey};

/// Context string for deriving named log keys from the store seed
const NAMED_LOG_CONTEXT: &str = "rehoster local log store 2024-01-01 named log";
const LOG_FILE_EXTENSION: &str = "log";
const EVENT_CAPACITY: usize = 1024;

/// Called with a log's discovery key whenever it gains blocks or demand
pub(crate) type ChangeNotifier = Arc<dyn Fn(DiscoveryKey) + Send + Sync>;

type NotifierSlot = Arc<Mutex<Option<ChangeNotifier>>>;

/// Log store backed by memory, optionally persisted to disk
///
/// Every log is kept in memory. With [`LocalLogStore::fs`], each log is also
/// written through to `<dir>/<hex key>.log` as a sequence of u32le
/// length-prefixed frames, and loaded back on first open.
#[derive(Clone)]
pub struct LocalLogStore {
    inner: Arc<LocalLogStoreInner>,
}

struct LocalLogStoreInner {
    seed: SecretKey,
    dir: Option<PathBuf>,
    logs: Mutex<HashMap<PublicKey, Arc<LogCore>>>,
    notifier: NotifierSlot,
    closed: AtomicBool,
}

impl fmt::Debug for LocalLogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLogStore")
            .field("seed", &self.inner.seed.public())
            .field("dir", &self.inner.dir)
            .field("logs", &self.inner.logs.lock().len())
            .finish()
    }
}

impl LocalLogStore {
    /// In-memory store with a random seed
    pub fn memory() -> Self {
        Self::with_seed(SecretKey::generate(), None)
    }

    /// Store persisted under `dir`. The seed must be stable across
    ///  restarts for named logs to keep their keys.
    pub async fn fs(dir: impl AsRef<Path>, seed: SecretKey) -> Result<Self, LogError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self::with_seed(seed, Some(dir)))
    }

    fn with_seed(seed: SecretKey, dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LocalLogStoreInner {
                seed,
                dir,
                logs: Mutex::new(HashMap::new()),
                notifier: Arc::new(Mutex::new(None)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Key a named log would get, without opening it
    pub fn named_key(&self, name: &str) -> PublicKey {
        self.named_secret(name).public()
    }

    fn named_secret(&self, name: &str) -> SecretKey {
        self.inner.seed.derive(NAMED_LOG_CONTEXT, name.as_bytes())
    }

    pub(crate) fn set_notifier(&self, notifier: ChangeNotifier) {
        *self.inner.notifier.lock() = Some(notifier);
    }

    /// Logs currently open on this store under the given topic
    pub(crate) fn cores_for(&self, topic: &DiscoveryKey) -> Vec<Arc<LogCore>> {
        self.inner
            .logs
            .lock()
            .values()
            .filter(|core| core.discovery_key == *topic)
            .cloned()
            .collect()
    }

    pub(crate) fn core_for(&self, key: &PublicKey) -> Option<Arc<LogCore>> {
        self.inner.logs.lock().get(key).cloned()
    }

    async fn load_core(
        &self,
        key: PublicKey,
        secret: Option<SecretKey>,
    ) -> Result<Arc<LogCore>, LogError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::StoreClosed);
        }

        if let Some(core) = self.core_for(&key) {
            if let Some(secret) = secret {
                core.set_secret(secret);
            }
            return Ok(core);
        }

        let path = self
            .inner
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", key.to_hex(), LOG_FILE_EXTENSION)));
        let blocks = match &path {
            Some(path) => read_frames(path).await?,
            None => Vec::new(),
        };

        let core = Arc::new(LogCore::new(
            key,
            secret,
            blocks,
            path,
            self.inner.notifier.clone(),
        ));
        let core = self
            .inner
            .logs
            .lock()
            .entry(key)
            .or_insert(core)
            .clone();

        // peers already on the topic may hold blocks for it
        core.notify();
        Ok(core)
    }
}

#[async_trait]
impl LogStore for LocalLogStore {
    type Log = LocalLog;

    async fn open(&self, key: PublicKey) -> Result<LocalLog, LogError> {
        let core = self.load_core(key, None).await?;
        Ok(LocalLog::new(core))
    }

    async fn create(&self, name: &str) -> Result<LocalLog, LogError> {
        let secret = self.named_secret(name);
        let core = self.load_core(secret.public(), Some(secret)).await?;
        Ok(LocalLog::new(core))
    }

    async fn close(&self) -> Result<(), LogError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Default)]
struct CoreState {
    blocks: Vec<Bytes>,
    /// Longest length advertised by a peer
    remote_length: u64,
    want_until: u64,
    want_all: bool,
}

/// Shared state of one log, referenced by every session on it
pub(crate) struct LogCore {
    key: PublicKey,
    discovery_key: DiscoveryKey,
    secret: Mutex<Option<SecretKey>>,
    state: Mutex<CoreState>,
    contiguous: watch::Sender<u64>,
    events: broadcast::Sender<LogEvent>,
    /// Serializes writers so file frames land in block order
    io: tokio::sync::Mutex<()>,
    path: Option<PathBuf>,
    notifier: NotifierSlot,
}

impl LogCore {
    fn new(
        key: PublicKey,
        secret: Option<SecretKey>,
        blocks: Vec<Bytes>,
        path: Option<PathBuf>,
        notifier: NotifierSlot,
    ) -> Self {
        let (contiguous, _) = watch::channel(blocks.len() as u64);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            key,
            discovery_key: key.discovery_key(),
            secret: Mutex::new(secret),
            state: Mutex::new(CoreState {
                blocks,
                ..Default::default()
            }),
            contiguous,
            events,
            io: tokio::sync::Mutex::new(()),
            path,
            notifier,
        }
    }

    pub(crate) fn key(&self) -> PublicKey {
        self.key
    }

    fn set_secret(&self, secret: SecretKey) {
        self.secret.lock().get_or_insert(secret);
    }

    fn writable(&self) -> bool {
        self.secret.lock().is_some()
    }

    pub(crate) fn length(&self) -> u64 {
        let state = self.state.lock();
        (state.blocks.len() as u64).max(state.remote_length)
    }

    pub(crate) fn contiguous_length(&self) -> u64 {
        self.state.lock().blocks.len() as u64
    }

    /// Blocks this copy still wants, as an exclusive upper bound
    pub(crate) fn demand(&self) -> u64 {
        let state = self.state.lock();
        if state.want_all {
            u64::MAX
        } else {
            state.want_until
        }
    }

    pub(crate) fn blocks(&self, start: u64, end: u64) -> Vec<Bytes> {
        let state = self.state.lock();
        let end = end.min(state.blocks.len() as u64);
        if start >= end {
            return Vec::new();
        }
        state.blocks[start as usize..end as usize].to_vec()
    }

    fn block(&self, index: u64) -> Option<Bytes> {
        self.state.lock().blocks.get(index as usize).cloned()
    }

    fn want(&self, range: DownloadRange) {
        let changed = {
            let mut state = self.state.lock();
            match range.end {
                None if !state.want_all => {
                    state.want_all = true;
                    true
                }
                Some(end) if end > state.want_until => {
                    state.want_until = end;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify();
        }
    }

    fn notify(&self) {
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier(self.discovery_key);
        }
    }

    async fn append(&self, block: Bytes) -> Result<u64, LogError> {
        if !self.writable() {
            return Err(LogError::NotWritable(self.key));
        }

        let _io = self.io.lock().await;
        self.persist(std::slice::from_ref(&block)).await?;
        let length = {
            let mut state = self.state.lock();
            state.blocks.push(block);
            state.blocks.len() as u64
        };

        self.contiguous.send_replace(length);
        let _ = self.events.send(LogEvent::Append { length });
        self.notify();
        Ok(length)
    }

    /// Note that a peer holds `length` blocks
    pub(crate) fn learn_length(&self, length: u64) {
        let grew = {
            let mut state = self.state.lock();
            let known = (state.blocks.len() as u64).max(state.remote_length);
            state.remote_length = state.remote_length.max(length);
            length > known
        };
        if grew {
            let _ = self.events.send(LogEvent::Append { length });
        }
    }

    /// Store blocks replicated from a peer, starting at index `start`.
    ///  Blocks already held are skipped; a gap is refused.
    pub(crate) async fn receive(&self, start: u64, blocks: Vec<Bytes>) -> Result<u64, LogError> {
        let _io = self.io.lock().await;

        let held = self.contiguous_length();
        if start > held {
            tracing::warn!(
                log = %self.key.short(),
                start,
                held,
                "refusing replicated blocks past a gap"
            );
            return Ok(0);
        }
        let skip = (held - start) as usize;
        if skip >= blocks.len() {
            return Ok(0);
        }
        let fresh = &blocks[skip..];

        self.persist(fresh).await?;
        let length = {
            let mut state = self.state.lock();
            state.blocks.extend_from_slice(fresh);
            state.blocks.len() as u64
        };

        self.contiguous.send_replace(length);
        for index in held..length {
            let _ = self.events.send(LogEvent::Download { index });
        }
        self.notify();
        Ok(fresh.len() as u64)
    }

    async fn persist(&self, blocks: &[Bytes]) -> Result<(), LogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut frames = BytesMut::new();
        for block in blocks {
            frames.put_u32_le(block.len() as u32);
            frames.extend_from_slice(block);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&frames).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn read_frames(path: &Path) -> Result<Vec<Bytes>, LogError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => Bytes::from(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut buf = data;
    let mut blocks = Vec::new();
    while buf.remaining() >= 4 {
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            tracing::warn!(path = ?path, "ignoring truncated trailing frame");
            break;
        }
        blocks.push(buf.split_to(len));
    }
    Ok(blocks)
}

/// A session on a [`LocalLogStore`] log
#[derive(Clone)]
pub struct LocalLog {
    core: Arc<LogCore>,
    closed: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for LocalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLog")
            .field("key", &self.core.key)
            .field("length", &self.core.length())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LocalLog {
    fn new(core: Arc<LogCore>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            core,
            closed: Arc::new(closed),
        }
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.is_closed() {
            return Err(LogError::Closed(self.core.key));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    fn key(&self) -> PublicKey {
        self.core.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.core.discovery_key
    }

    fn writable(&self) -> bool {
        self.core.writable()
    }

    fn length(&self) -> u64 {
        self.core.length()
    }

    fn contiguous_length(&self) -> u64 {
        self.core.contiguous_length()
    }

    async fn get(&self, index: u64, wait: bool) -> Result<Option<Bytes>, LogError> {
        self.ensure_open()?;
        if let Some(block) = self.core.block(index) {
            return Ok(Some(block));
        }
        if !wait {
            return Ok(None);
        }

        let mut contiguous = self.core.contiguous.subscribe();
        let mut closed = self.closed.subscribe();
        self.core.want(DownloadRange {
            start: index,
            end: Some(index + 1),
        });

        loop {
            if let Some(block) = self.core.block(index) {
                return Ok(Some(block));
            }
            if *closed.borrow() {
                return Err(LogError::Closed(self.core.key));
            }
            tokio::select! {
                res = contiguous.changed() => {
                    if res.is_err() {
                        return Err(LogError::Closed(self.core.key));
                    }
                }
                _ = closed.changed() => {}
            }
        }
    }

    async fn append(&self, block: Bytes) -> Result<u64, LogError> {
        self.ensure_open()?;
        self.core.append(block).await
    }

    fn download(&self, range: DownloadRange) -> Result<(), LogError> {
        self.ensure_open()?;
        self.core.want(range);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.core.events.subscribe()
    }

    fn watch_length(&self) -> watch::Receiver<u64> {
        self.core.contiguous.subscribe()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn close(&self) -> Result<(), LogError> {
        self.closed.send_replace(true);
        Ok(())
    }
}
