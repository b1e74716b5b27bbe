//! Key material for replicated logs
//!
//! - **Identity**: every replicated log is addressed by an Ed25519 public key
//!   (`PublicKey`). Hex and z-base-32 renderings normalize to the same bytes.
//! - **Rendezvous**: a `DiscoveryKey` is a one-way derivation of a public key,
//!   used as the overlay-network topic without revealing the log's identity.
//! - **Authorship**: a `SecretKey` makes a log writable. The local log store
//!   derives one per named log from its primary seed.

mod keys;

pub use keys::{
    DiscoveryKey, KeyError, PublicKey, SecretKey, DISCOVERY_KEY_SIZE, PRIVATE_KEY_SIZE,
    PUBLIC_KEY_SIZE,
};
