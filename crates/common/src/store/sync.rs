//! Reconciling the store to a desired set
//!
//! At most one reconciliation runs at a time. Every call registers its own
//! desired state as "next"; a call that finds a run in flight waits for it,
//! then gives up with [`SyncOutcome::Superseded`] if someone registered a
//! newer desired state meanwhile. The same holds for the call whose run was
//! in flight: once a newer state is registered its set is stale, even if it
//! was written. Requests are told apart by identity, never by value, so only
//! the latest caller reports its set applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::{KeyedStore, RehostValue, StoreError};
use crate::crypto::PublicKey;
use crate::log::ReplicatedLog;

/// The complete set a store should contain after a sync
pub type DesiredState = BTreeMap<PublicKey, RehostValue>;

/// Superseded-and-retried rounds after which the coalescing logic is assumed broken
const MAX_SYNC_ROUNDS: u64 = 100_000;

type Run = Shared<BoxFuture<'static, Result<(), StoreError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This call's desired state was applied
    Applied,
    /// A later call's desired state replaced this one before it ran, or
    ///  while it ran
    Superseded,
}

#[derive(Default)]
pub(crate) struct SyncSlots {
    inner: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    running: Option<Run>,
    next: Option<Arc<DesiredState>>,
}

impl std::fmt::Debug for SyncSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.inner.lock();
        f.debug_struct("SyncSlots")
            .field("running", &slots.running.is_some())
            .field("next", &slots.next.as_ref().map(|n| n.len()))
            .finish()
    }
}

impl SyncSlots {
    fn finish(&self, run: &Run) {
        let mut slots = self.inner.lock();
        if slots.running.as_ref().is_some_and(|r| r.ptr_eq(run)) {
            slots.running = None;
        }
    }

    fn is_next(&self, desired: &Arc<DesiredState>) -> bool {
        self.inner
            .lock()
            .next
            .as_ref()
            .is_some_and(|next| Arc::ptr_eq(next, desired))
    }
}

enum Step {
    Run(Run),
    Wait(Run),
}

impl<L: ReplicatedLog> KeyedStore<L> {
    /// Make the stored set exactly `desired`: delete every stored key it
    ///  lacks, add every entry it has. Adds of unchanged entries write
    ///  nothing, so syncing the same set twice leaves the version alone.
    ///
    /// # Panics
    ///
    /// When a call is made to wait more than 100,000 rounds, which means
    ///  runs are being started without ever clearing the slot.
    pub async fn sync(&self, desired: DesiredState) -> Result<SyncOutcome, StoreError> {
        let desired = Arc::new(desired);
        let mut rounds: u64 = 0;

        loop {
            let step = {
                let mut slots = self.sync.inner.lock();
                if rounds == 0 {
                    slots.next = Some(desired.clone());
                } else if !slots
                    .next
                    .as_ref()
                    .is_some_and(|next| Arc::ptr_eq(next, &desired))
                {
                    return Ok(SyncOutcome::Superseded);
                }

                match &slots.running {
                    Some(running) => Step::Wait(running.clone()),
                    None => {
                        let run = reconcile(self.clone(), desired.clone()).boxed().shared();
                        slots.running = Some(run.clone());
                        Step::Run(run)
                    }
                }
            };

            match step {
                Step::Run(run) => {
                    let result = run.clone().await;
                    self.sync.finish(&run);
                    result?;
                    return Ok(if self.sync.is_next(&desired) {
                        SyncOutcome::Applied
                    } else {
                        SyncOutcome::Superseded
                    });
                }
                Step::Wait(running) => {
                    // failures of other runs belong to their callers
                    let _ = running.clone().await;
                    self.sync.finish(&running);
                }
            }

            rounds += 1;
            assert!(
                rounds <= MAX_SYNC_ROUNDS,
                "sync waited {} rounds without running, the single-flight slot is never cleared",
                rounds
            );
        }
    }
}

async fn reconcile<L: ReplicatedLog>(
    store: KeyedStore<L>,
    desired: Arc<DesiredState>,
) -> Result<(), StoreError> {
    // syncs requested in the same tick coalesce onto this run
    tokio::task::yield_now().await;

    let stale: Vec<_> = store
        .scan()
        .await?
        .into_iter()
        .filter(|entry| {
            entry
                .public_key()
                .map_or(true, |key| !desired.contains_key(&key))
        })
        .map(|entry| entry.raw_key())
        .collect();

    let deletes = future::try_join_all(stale.iter().map(|raw| store.delete_raw(raw)));
    let adds = future::try_join_all(
        desired
            .iter()
            .map(|(key, value)| store.add(*key, value.clone())),
    );
    let (deleted, added) = future::try_join(deletes, adds).await?;

    tracing::debug!(
        deleted = deleted.into_iter().filter(|d| *d).count(),
        added = added.into_iter().filter(|a| *a).count(),
        "reconciled rehost set"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::crypto::SecretKey;
    use crate::index::{sub_key, REHOST_SUB_PREFIX};
    use crate::log::{LocalLog, LocalLogStore, LogStore};
    use crate::store::encoding;

    async fn store() -> KeyedStore<LocalLog> {
        let logs = LocalLogStore::memory();
        KeyedStore::open(logs.create("store").await.unwrap())
            .await
            .unwrap()
    }

    fn keys(n: usize) -> Vec<PublicKey> {
        (0..n).map(|_| SecretKey::generate().public()).collect()
    }

    fn desired(keys: &[PublicKey]) -> DesiredState {
        keys.iter()
            .map(|k| (*k, RehostValue::default()))
            .collect()
    }

    async fn stored(store: &KeyedStore<LocalLog>) -> BTreeSet<PublicKey> {
        store
            .scan()
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.public_key())
            .collect()
    }

    #[tokio::test]
    async fn test_sync_replaces_set() {
        let store = store().await;
        let k = keys(3);

        store.add(k[0], RehostValue::default()).await.unwrap();
        store.add(k[1], RehostValue::default()).await.unwrap();

        let outcome = store.sync(desired(&k[1..])).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied);

        assert_eq!(stored(&store).await, k[1..].iter().copied().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let store = store().await;
        let k = keys(2);

        store.sync(desired(&k)).await.unwrap();
        let version = store.version();
        store.sync(desired(&k)).await.unwrap();
        assert_eq!(store.version(), version);
    }

    #[tokio::test]
    async fn test_sync_removes_invalid_entries() {
        let store = store().await;
        let k = keys(1);
        store
            .index()
            .put(
                &sub_key(REHOST_SUB_PREFIX, b"garbage"),
                &encoding::encode(&RehostValue::default()),
                None,
            )
            .await
            .unwrap();

        store.sync(desired(&k)).await.unwrap();
        assert_eq!(store.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_race_latest_wins() {
        let store = store().await;
        let k = keys(3);

        let (first, second, third) = tokio::join!(
            store.sync(desired(&k[..1])),
            store.sync(desired(&k[..2])),
            store.sync(desired(&k)),
        );

        // the first set was written, but a newer one was registered while it ran
        assert_eq!(first.unwrap(), SyncOutcome::Superseded);
        assert_eq!(second.unwrap(), SyncOutcome::Superseded);
        assert_eq!(third.unwrap(), SyncOutcome::Applied);

        assert_eq!(stored(&store).await, k.iter().copied().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn test_equal_sets_are_still_distinct_requests() {
        let store = store().await;
        let k = keys(1);

        let (a, b, c) = tokio::join!(
            store.sync(desired(&k)),
            store.sync(desired(&k)),
            store.sync(desired(&k)),
        );
        assert_eq!(a.unwrap(), SyncOutcome::Superseded);
        assert_eq!(b.unwrap(), SyncOutcome::Superseded);
        assert_eq!(c.unwrap(), SyncOutcome::Applied);
    }

    #[tokio::test]
    async fn test_running_set_is_superseded_by_later_request() {
        let store = store().await;
        let k = keys(2);

        let (first, second) = tokio::join!(
            store.sync(desired(&k[..1])),
            store.sync(desired(&k[1..])),
        );
        assert_eq!(first.unwrap(), SyncOutcome::Superseded);
        assert_eq!(second.unwrap(), SyncOutcome::Applied);
        assert_eq!(stored(&store).await, BTreeSet::from([k[1]]));

        // with nothing newer registered, a lone sync is applied
        let outcome = store.sync(desired(&k)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied);
    }
}
