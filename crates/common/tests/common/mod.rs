//! Shared test utilities for rehoster integration tests
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use ::common::crypto::{DiscoveryKey, PublicKey, SecretKey};
use ::common::log::LocalLogStore;
use ::common::rehoster::Rehoster;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Install a subscriber once, honouring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_key() -> PublicKey {
    SecretKey::generate().public()
}

pub fn topics(keys: &[PublicKey]) -> BTreeSet<DiscoveryKey> {
    keys.iter().map(|k| k.discovery_key()).collect()
}

/// Wait until the rehoster serves exactly `keys`
pub async fn served_exactly(rehoster: &Rehoster<LocalLogStore>, keys: &[PublicKey]) {
    let expected = topics(keys);
    common::testkit::eventually(TIMEOUT, || {
        let served = rehoster.served_keys();
        let expected = expected.clone();
        async move { Ok(served == expected) }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "served {:?}, expected {:?}",
            rehoster.served_keys(),
            expected
        )
    });
}

/// Wait until a synchronous condition holds
pub async fn until(condition: impl Fn() -> bool) -> anyhow::Result<()> {
    common::testkit::eventually(TIMEOUT, || {
        let holds = condition();
        async move { Ok(holds) }
    })
    .await
}
