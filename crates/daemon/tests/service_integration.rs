//! Integration tests for the daemon service lifecycle
//!
//! These run the service in-process against a temporary log directory.

use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;

use ::common::crypto::SecretKey;
use ::common::store::RehostValue;
use rehoster_daemon::{start_service, ServiceConfig};

fn config(dir: &TempDir, secret: SecretKey) -> ServiceConfig {
    ServiceConfig {
        secret,
        logs_path: dir.path().join("logs"),
        index_name: "rehoster-bee".to_string(),
        rehost: None,
        log_level: tracing::Level::DEBUG,
        log_dir: None,
    }
}

#[tokio::test]
async fn test_service_syncs_configured_set() {
    let dir = TempDir::new().unwrap();
    let listed = SecretKey::generate().public();

    let mut config = config(&dir, SecretKey::generate());
    config.rehost = Some(BTreeMap::from([(listed, RehostValue::described("listed"))]));

    let (state, handle) = start_service(&config).await;
    let rehoster = state.rehoster().clone();
    assert!(rehoster.has(&listed).await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !rehoster.served_keys().contains(&listed.discovery_key()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listed key never served");
    assert!(rehoster
        .served_keys()
        .contains(&rehoster.own_discovery_key()));

    handle.shutdown();
    handle.wait().await;
    assert!(rehoster.served_keys().is_empty());
}

#[tokio::test]
async fn test_service_restart_keeps_own_key() {
    let dir = TempDir::new().unwrap();
    let secret = SecretKey::generate();
    let listed = SecretKey::generate().public();

    let (state, handle) = start_service(&config(&dir, secret.clone())).await;
    let own = state.rehoster().own_key();
    state
        .rehoster()
        .add(listed, RehostValue::default())
        .await
        .unwrap();
    handle.shutdown();
    handle.wait().await;

    let (state, handle) = start_service(&config(&dir, secret)).await;
    assert_eq!(state.rehoster().own_key(), own);
    assert!(state.rehoster().has(&listed).await.unwrap());
    handle.shutdown();
    handle.wait().await;
}
