//! Integration tests for a single rehoster: serving, ref counting and invalid entries

mod common;

use std::time::Duration;

use ::common::events::RehostEvent;
use ::common::log::ReplicatedLog;
use ::common::rehoster::{RehosterConfig, ROOT_DESCRIPTION};
use ::common::store::{RehostValue, Version};
use ::common::testkit::{collect_events, wait_for_event, TestNetwork};

use crate::common::{init_tracing, random_key, served_exactly, topics, until, TIMEOUT};

#[tokio::test]
async fn test_add_update_delete_scenario() -> anyhow::Result<()> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let rehoster = alice.rehoster().await?;
    let own = rehoster.own_key();
    let k1 = random_key();

    served_exactly(&rehoster, &[own]).await;

    assert!(rehoster.add(k1, RehostValue::described("d1")).await?);
    served_exactly(&rehoster, &[own, k1]).await;

    let version = rehoster.store().version();
    assert!(!rehoster.add(k1, RehostValue::described("d1")).await?);
    assert_eq!(rehoster.store().version(), version);

    assert!(rehoster.add(k1, RehostValue::described("d2")).await?);
    assert_eq!(rehoster.store().version(), version + 1);
    assert_eq!(
        rehoster.get(&k1).await?.and_then(|e| e.description),
        Some("d2".to_string())
    );
    served_exactly(&rehoster, &[own, k1]).await;

    assert!(rehoster.delete(&k1).await?);
    served_exactly(&rehoster, &[own]).await;
    assert!(!rehoster.has(&k1).await?);

    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_root_is_described() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let events = ::common::events::EventSink::default();
    let mut rx = events.subscribe();
    let rehoster = alice
        .rehoster_with(RehosterConfig::default(), events)
        .await?;

    let event = wait_for_event(&mut rx, TIMEOUT, |e| matches!(e, RehostEvent::NewNode { .. })).await?;
    assert_eq!(
        event,
        RehostEvent::NewNode {
            public_key: rehoster.own_key(),
            description: Some(ROOT_DESCRIPTION.to_string()),
            refs: 1,
        }
    );
    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_replacing_value_keeps_one_node() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let rehoster = alice.rehoster().await?;
    let key = random_key();

    rehoster.add(key, RehostValue::described("first")).await?;
    served_exactly(&rehoster, &[rehoster.own_key(), key]).await;
    rehoster.add(key, RehostValue::described("second")).await?;

    let manager = rehoster.manager();
    until(|| {
        manager
            .node(&rehoster.own_key())
            .is_some_and(|root| root.child_keys() == vec![key])
    })
    .await?;
    // let the replacement settle before counting
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.node_count(), 2);
    assert_eq!(manager.ref_count(&key), 1);

    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_incompatible_version_is_skipped() -> anyhow::Result<()> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let rehoster = alice.rehoster().await?;
    let mut events = rehoster.subscribe();
    let foreign = random_key();

    rehoster
        .add(
            foreign,
            RehostValue::described("from the future").with_version(Version::new(2, 0)),
        )
        .await?;

    let event = wait_for_event(&mut events, TIMEOUT, |e| {
        matches!(e, RehostEvent::InvalidValue { .. })
    })
    .await?;
    match event {
        RehostEvent::InvalidValue { parent, key, error } => {
            assert_eq!(parent, rehoster.own_key());
            assert_eq!(key, foreign);
            assert!(error.to_string().contains("other major version"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let later = collect_events(&mut events, Duration::from_millis(100)).await;
    assert!(!later
        .iter()
        .any(|e| matches!(e, RehostEvent::InvalidValue { .. })));
    assert!(!rehoster.served_keys().contains(&foreign.discovery_key()));
    assert_eq!(rehoster.manager().node_count(), 1);

    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_entry_turning_invalid_and_back() -> anyhow::Result<()> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let rehoster = alice.rehoster().await?;
    let own = rehoster.own_key();
    let key = random_key();

    rehoster.add(key, RehostValue::described("valid")).await?;
    served_exactly(&rehoster, &[own, key]).await;

    let mut events = rehoster.subscribe();
    assert!(
        rehoster
            .add(
                key,
                RehostValue::described("unreadable").with_version(Version::new(2, 0)),
            )
            .await?
    );
    let event = wait_for_event(&mut events, TIMEOUT, |e| {
        matches!(e, RehostEvent::InvalidValue { .. })
    })
    .await?;
    assert!(matches!(event, RehostEvent::InvalidValue { key: k, .. } if k == key));

    // the replaced entry no longer stands, so its node goes
    served_exactly(&rehoster, &[own]).await;
    let manager = rehoster.manager();
    until(|| manager.ref_count(&key) == 0).await?;
    assert_eq!(manager.node_count(), 1);
    let later = collect_events(&mut events, Duration::from_millis(100)).await;
    assert!(!later
        .iter()
        .any(|e| matches!(e, RehostEvent::InvalidValue { .. })));

    assert!(rehoster.add(key, RehostValue::described("valid again")).await?);
    served_exactly(&rehoster, &[own, key]).await;
    until(|| manager.ref_count(&key) == 1).await?;

    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_drive_content_is_requested_not_served() -> anyhow::Result<()> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let (drive, content) = alice.create_drive("drive").await?;
    let rehoster = alice.rehoster().await?;

    rehoster
        .add(drive.key(), RehostValue::described("a drive"))
        .await?;

    until(|| {
        rehoster
            .requested_keys()
            .contains(&content.key().discovery_key())
    })
    .await?;

    let served = rehoster.served_keys();
    assert_eq!(served, topics(&[rehoster.own_key(), drive.key()]));
    assert!(!served.contains(&content.key().discovery_key()));
    assert!(rehoster.keys().contains(&content.key().discovery_key()));

    let drive_node = rehoster.manager().node(&drive.key()).expect("drive tracked");
    assert_eq!(drive_node.secondary_key(), Some(content.key()));
    assert!(drive_node.child_keys().is_empty());

    rehoster.delete(&drive.key()).await?;
    served_exactly(&rehoster, &[rehoster.own_key()]).await;
    until(|| rehoster.requested_keys().is_empty()).await?;

    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_key_reachable_twice_is_ref_counted() -> anyhow::Result<()> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let rehoster = alice.rehoster().await?;
    let sub = alice
        .rehoster_with(
            RehosterConfig {
                index_name: "sub-rehoster".to_string(),
            },
            Default::default(),
        )
        .await?;
    let shared = random_key();
    let own = rehoster.own_key();

    sub.add(shared, RehostValue::described("via sub")).await?;
    rehoster.add(shared, RehostValue::described("direct")).await?;
    rehoster.add(sub.own_key(), RehostValue::described("sub")).await?;

    served_exactly(&rehoster, &[own, sub.own_key(), shared]).await;
    until(|| rehoster.manager().ref_count(&shared) == 2).await?;

    rehoster.delete(&shared).await?;
    until(|| rehoster.manager().ref_count(&shared) == 1).await?;
    assert!(rehoster.served_keys().contains(&shared.discovery_key()));

    sub.delete(&shared).await?;
    served_exactly(&rehoster, &[own, sub.own_key()]).await;
    assert_eq!(rehoster.manager().ref_count(&shared), 0);

    sub.close().await?;
    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_keys_are_reported() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let rehoster = alice.rehoster().await?;
    let mut events = rehoster.subscribe();

    rehoster
        .store()
        .index()
        .put(
            &::common::index::sub_key(::common::index::REHOST_SUB_PREFIX, b"short"),
            &::common::store::encoding::encode(&RehostValue::default()),
            None,
        )
        .await?;

    let event = wait_for_event(&mut events, TIMEOUT, |e| {
        matches!(e, RehostEvent::InvalidKey { .. })
    })
    .await?;
    assert_eq!(
        event,
        RehostEvent::InvalidKey {
            invalid_key: bytes::Bytes::from_static(b"short"),
            parent: rehoster.own_key(),
        }
    );
    assert!(rehoster.entries().await?.is_empty());

    rehoster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_plain_log_updates_are_reported() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice")?;
    let log = alice.create_log("notes", &["one"]).await?;
    let rehoster = alice.rehoster().await?;
    let mut events = rehoster.subscribe();

    rehoster.add(log.key(), RehostValue::default()).await?;
    served_exactly(&rehoster, &[rehoster.own_key(), log.key()]).await;

    log.append(bytes::Bytes::from_static(b"two")).await?;
    let key = log.key();
    let event = wait_for_event(&mut events, TIMEOUT, |e| {
        matches!(e, RehostEvent::NodeUpdate { public_key, .. } if *public_key == key)
    })
    .await?;
    assert_eq!(
        event,
        RehostEvent::NodeUpdate {
            public_key: key,
            length: 2
        }
    );

    rehoster.close().await?;
    Ok(())
}
