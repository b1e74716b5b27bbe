//! Durable rehost set
//!
//! A [`KeyedStore`] maps public keys to [`RehostEntry`] values inside the
//! rehost namespace of a keyed index. The index must carry the rehoster
//! marker in its header: a fresh writable log gets it on open, an empty
//! read-only one is waited on, and anything else is refused.

use std::sync::Arc;

use bytes::Bytes;

use crate::crypto::{KeyError, PublicKey};
use crate::index::{sub_key, Header, IndexError, KeyedIndex, REHOST_SUB_PREFIX};
use crate::log::ReplicatedLog;

pub mod encoding;
mod sync;

pub use encoding::{EncodingError, RehostEntry, RehostValue, Version};
pub use sync::{DesiredState, SyncOutcome};

use sync::SyncSlots;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("log {0} is not a rehoster")]
    NotARehoster(PublicKey),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// One stored entry, as found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedEntry {
    Valid {
        key: PublicKey,
        entry: RehostEntry,
    },
    /// The stored key is not a public key
    InvalidKey { raw_key: Bytes },
    /// The stored value does not decode
    InvalidValue {
        key: PublicKey,
        raw_value: Bytes,
        error: EncodingError,
    },
}

impl ScannedEntry {
    pub fn raw_key(&self) -> Bytes {
        match self {
            ScannedEntry::Valid { key, .. } | ScannedEntry::InvalidValue { key, .. } => {
                Bytes::copy_from_slice(&key.to_bytes())
            }
            ScannedEntry::InvalidKey { raw_key } => raw_key.clone(),
        }
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        match self {
            ScannedEntry::Valid { key, .. } | ScannedEntry::InvalidValue { key, .. } => Some(*key),
            ScannedEntry::InvalidKey { .. } => None,
        }
    }
}

/// Decode a raw rehost-namespace entry
pub fn parse_entry(raw_key: &Bytes, raw_value: &Bytes) -> ScannedEntry {
    let key = match PublicKey::try_from(&raw_key[..]) {
        Ok(key) => key,
        Err(_) => {
            return ScannedEntry::InvalidKey {
                raw_key: raw_key.clone(),
            }
        }
    };
    match encoding::decode(raw_value) {
        Ok(entry) => ScannedEntry::Valid { key, entry },
        Err(error) => ScannedEntry::InvalidValue {
            key,
            raw_value: raw_value.clone(),
            error,
        },
    }
}

#[derive(Debug, Clone)]
pub struct KeyedStore<L> {
    index: KeyedIndex<L>,
    sync: Arc<SyncSlots>,
}

impl<L: ReplicatedLog> KeyedStore<L> {
    pub async fn open(log: L) -> Result<Self, StoreError> {
        let index = KeyedIndex::new(log);
        ensure_is_rehoster(&index).await?;
        Ok(Self {
            index,
            sync: Arc::default(),
        })
    }

    pub fn key(&self) -> PublicKey {
        self.index.log().key()
    }

    pub fn index(&self) -> &KeyedIndex<L> {
        &self.index
    }

    pub fn version(&self) -> u64 {
        self.index.version()
    }

    /// Store `value` under `key`, unless an equal entry is already there.
    ///  Returns whether anything was written.
    pub async fn add(&self, key: PublicKey, value: RehostValue) -> Result<bool, StoreError> {
        let encoded = encoding::encode(&value);
        let differs = |previous: &[u8], next: &[u8]| {
            match (encoding::decode(previous), encoding::decode(next)) {
                (Ok(previous), Ok(next)) => previous != next,
                _ => previous != next,
            }
        };
        let written = self
            .index
            .put(&rehost_key(&key.to_bytes()), &encoded, Some(&differs))
            .await?;
        if written {
            tracing::debug!(key = %key.short(), "stored rehost entry");
        }
        Ok(written)
    }

    pub async fn get(&self, key: &PublicKey) -> Result<Option<RehostEntry>, StoreError> {
        match self.index.get(&rehost_key(&key.to_bytes())).await? {
            Some(raw) => Ok(Some(encoding::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether anything is stored under `key`, valid or not
    pub async fn has(&self, key: &PublicKey) -> Result<bool, StoreError> {
        Ok(self
            .index
            .get(&rehost_key(&key.to_bytes()))
            .await?
            .is_some())
    }

    /// Remove `key`. Removing an absent key is a no-op.
    pub async fn delete(&self, key: &PublicKey) -> Result<bool, StoreError> {
        self.delete_raw(&key.to_bytes()).await
    }

    pub(crate) async fn delete_raw(&self, raw_key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.index.del(&rehost_key(raw_key)).await?)
    }

    /// Every stored entry in key order, invalid ones included
    pub async fn scan(&self) -> Result<Vec<ScannedEntry>, StoreError> {
        let entries = self.index.entries(REHOST_SUB_PREFIX).await?;
        Ok(entries
            .iter()
            .map(|entry| parse_entry(&entry.key, &entry.value))
            .collect())
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.index
            .log()
            .close()
            .await
            .map_err(|e| StoreError::Index(e.into()))
    }
}

fn rehost_key(raw_key: &[u8]) -> Vec<u8> {
    sub_key(REHOST_SUB_PREFIX, raw_key)
}

async fn ensure_is_rehoster<L: ReplicatedLog>(index: &KeyedIndex<L>) -> Result<(), StoreError> {
    let log = index.log();
    if log.length() == 0 && log.writable() {
        index.init_header(Header::rehoster()).await?;
    }

    // an empty read-only log waits here for its first block
    match index.header(true).await {
        Ok(Some(header)) if header.metadata.is_rehoster() => Ok(()),
        Ok(_) | Err(IndexError::NotIndexed(_)) => Err(StoreError::NotARehoster(log.key())),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use crate::log::{LocalLogStore, LogStore};

    async fn store() -> KeyedStore<crate::log::LocalLog> {
        let logs = LocalLogStore::memory();
        KeyedStore::open(logs.create("store").await.unwrap())
            .await
            .unwrap()
    }

    fn key() -> PublicKey {
        SecretKey::generate().public()
    }

    #[tokio::test]
    async fn test_open_marks_fresh_log() {
        let store = store().await;
        let header = store.index().header(false).await.unwrap().unwrap();
        assert!(header.metadata.is_rehoster());
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn test_open_refuses_unmarked_index() {
        let logs = LocalLogStore::memory();
        let log = logs.create("drive").await.unwrap();
        KeyedIndex::new(log.clone())
            .init_header(Header::default())
            .await
            .unwrap();

        let res = KeyedStore::open(log.clone()).await;
        assert_eq!(res.err(), Some(StoreError::NotARehoster(log.key())));
    }

    #[tokio::test]
    async fn test_open_refuses_plain_log() {
        let logs = LocalLogStore::memory();
        let log = logs.create("plain").await.unwrap();
        log.append(Bytes::from("raw")).await.unwrap();

        assert!(matches!(
            KeyedStore::open(log).await,
            Err(StoreError::NotARehoster(_))
        ));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = store().await;
        let k = key();

        assert!(store.add(k, RehostValue::described("d1")).await.unwrap());
        let version = store.version();

        assert!(!store.add(k, RehostValue::described("d1")).await.unwrap());
        assert_eq!(store.version(), version);

        assert!(store.add(k, RehostValue::described("d2")).await.unwrap());
        assert_eq!(store.version(), version + 1);

        let entry = store.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.description.as_deref(), Some("d2"));
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let store = store().await;
        let k = key();
        let version = store.version();

        assert!(!store.delete(&k).await.unwrap());
        assert_eq!(store.version(), version);

        store.add(k, RehostValue::default()).await.unwrap();
        assert!(store.has(&k).await.unwrap());
        assert!(store.delete(&k).await.unwrap());
        assert!(!store.has(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_reports_invalid_entries() {
        let store = store().await;
        let good = key();
        let foreign = key();

        store.add(good, RehostValue::described("ok")).await.unwrap();
        store
            .add(foreign, RehostValue::default().with_version(Version::new(2, 0)))
            .await
            .unwrap();
        store
            .index()
            .put(&rehost_key(b"not a key"), &encoding::encode(&RehostValue::default()), None)
            .await
            .unwrap();

        let scanned = store.scan().await.unwrap();
        assert_eq!(scanned.len(), 3);
        assert!(scanned
            .iter()
            .any(|e| matches!(e, ScannedEntry::Valid { key, .. } if *key == good)));
        assert!(scanned
            .iter()
            .any(|e| matches!(e, ScannedEntry::InvalidValue { key, .. } if *key == foreign)));
        assert!(scanned
            .iter()
            .any(|e| matches!(e, ScannedEntry::InvalidKey { raw_key } if &raw_key[..] == b"not a key")));

        assert!(matches!(
            store.get(&foreign).await,
            Err(StoreError::Encoding(EncodingError::VersionMismatch { .. }))
        ));
    }
}
