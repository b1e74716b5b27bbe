//! Lightweight test harness for multi-peer integration tests
//!
//! Peers share an in-process network, so rehosters on different peers
//! replicate each other's logs without any external infrastructure.
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testkit::{wait_for_event, TestNetwork};
//!
//! #[tokio::test]
//! async fn test_rehost() -> anyhow::Result<()> {
//!     let mut net = TestNetwork::new();
//!     let alice = net.add_peer("alice")?;
//!     let log = alice.create_log("notes", &["hello"]).await?;
//!
//!     let rehoster = alice.rehoster().await?;
//!     let mut events = rehoster.subscribe();
//!     rehoster.add(log.key(), Default::default()).await?;
//!     wait_for_event(&mut events, TIMEOUT, |e| matches!(e, RehostEvent::NewNode { .. })).await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::events::RehostEvent;

mod network;
mod peer;

pub use network::{eventually, TestNetwork};
pub use peer::TestPeer;

/// Receive events until one matches `predicate`, failing after `timeout`
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<RehostEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Result<RehostEvent>
where
    F: FnMut(&RehostEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "test event receiver lagged");
                }
                Err(RecvError::Closed) => return Err(anyhow!("event stream closed")),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| anyhow!("no matching event within {:?}", timeout))?
}

/// Drain every event that arrives until the stream stays quiet for `quiet`
pub async fn collect_events(
    events: &mut broadcast::Receiver<RehostEvent>,
    quiet: Duration,
) -> Vec<RehostEvent> {
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(quiet, events.recv()).await {
            Ok(Ok(event)) => seen.push(event),
            Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => return seen,
        }
    }
}
