use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use iroh::{PublicKey as PPublicKey, SecretKey as SSecretKey};
use serde::{Deserialize, Serialize};

/// Size of Ed25519 private key in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Size of Ed25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Size of a discovery key in bytes
pub const DISCOVERY_KEY_SIZE: usize = 32;

/// Length of the z-base-32 rendering of a public key
const Z32_KEY_LEN: usize = 52;

/// Namespace under which discovery keys are derived from public keys.
///  Changing this changes every rendezvous topic on the network.
const DISCOVERY_NAMESPACE: [u8; 32] = *b"rehoster discovery key namespace";

/// Errors that can occur during key operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key size, expected {expected}, got {got}")]
    InvalidSize { expected: usize, got: usize },
    #[error("key is not a valid ed25519 point")]
    InvalidPoint,
    #[error("key is neither hex nor z-base-32: {0}")]
    InvalidEncoding(String),
    #[error("failed to parse PEM: {0}")]
    Pem(String),
}

/// Public key of a replicated log
///
/// A thin wrapper around Iroh's `PublicKey`, representing the public part of an
/// Ed25519 keypair. Every replicated log is content-addressed by one of these:
/// the key is the log's identity, and the only thing the rest of the system
/// compares logs by.
///
/// Textual forms (hex with or without `0x`, z-base-32) all normalize to the
/// same 32 bytes; `Display` renders lowercase hex.
///
/// # Examples
///
/// ```ignore
/// let key = SecretKey::generate().public();
/// let same: PublicKey = key.to_z32().parse()?;
/// assert_eq!(key, same);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Copy)]
pub struct PublicKey(PPublicKey);

impl Deref for PublicKey {
    type Target = PPublicKey;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<PPublicKey> for PublicKey {
    fn from(key: PPublicKey) -> Self {
        PublicKey(key)
    }
}

impl From<PublicKey> for PPublicKey {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl TryFrom<[u8; PUBLIC_KEY_SIZE]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: [u8; PUBLIC_KEY_SIZE]) -> Result<Self, Self::Error> {
        PPublicKey::from_bytes(&bytes)
            .map(PublicKey)
            .map_err(|_| KeyError::InvalidPoint)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let buff: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| KeyError::InvalidSize {
                expected: PUBLIC_KEY_SIZE,
                got: bytes.len(),
            })?;
        buff.try_into()
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    /// Accepts 64 hex characters (optionally `0x`-prefixed) or
    ///  52 z-base-32 characters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let hex_str = s.strip_prefix("0x").unwrap_or(s);
        if hex_str.len() == PUBLIC_KEY_SIZE * 2 {
            return Self::from_hex(hex_str);
        }
        if s.len() == Z32_KEY_LEN {
            return Self::from_z32(s);
        }
        Err(KeyError::InvalidEncoding(s.to_string()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl PublicKey {
    /// Parse a public key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff)
            .map_err(|_| KeyError::InvalidEncoding(hex.to_string()))?;
        buff.try_into()
    }

    /// Parse a public key from its z-base-32 rendering
    pub fn from_z32(s: &str) -> Result<Self, KeyError> {
        let bytes =
            z32::decode(s.as_bytes()).map_err(|_| KeyError::InvalidEncoding(s.to_string()))?;
        Self::try_from(bytes.as_slice())
    }

    /// Whether `bytes` would make a valid public key
    pub fn is_valid(bytes: &[u8]) -> bool {
        Self::try_from(bytes).is_ok()
    }

    /// Convert public key to raw bytes
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.0.as_bytes()
    }

    /// Convert public key to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Convert public key to z-base-32
    pub fn to_z32(&self) -> String {
        z32::encode(&self.to_bytes())
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..10].to_string()
    }

    /// Derive the rendezvous topic for this key.
    ///  The derivation is one-way: a discovery key reveals
    ///  nothing about the log it announces.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&DISCOVERY_NAMESPACE, &self.to_bytes()).as_bytes())
    }
}

/// Non-secret rendezvous topic for a [`PublicKey`]
///
/// Only used to find peers on the overlay network. Never use it
///  to identify a log: callers outside this crate must not assume
///  two keys map to distinct topics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; DISCOVERY_KEY_SIZE]);

impl DiscoveryKey {
    pub fn as_bytes(&self) -> &[u8; DISCOVERY_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; DISCOVERY_KEY_SIZE]> for DiscoveryKey {
    fn from(bytes: [u8; DISCOVERY_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", &self.to_hex()[..10])
    }
}

/// Secret key of a writable log
///
/// A thin wrapper around Iroh's `SecretKey`. The local log store keeps one of
/// these as its primary seed (persisted as `key.pem`) and derives the keypair
/// of every named log it creates from it.
///
/// # Examples
///
/// ```ignore
/// let secret_key = SecretKey::generate();
/// let pem = secret_key.to_pem();
/// let recovered = SecretKey::from_pem(&pem)?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretKey(pub SSecretKey);

impl From<[u8; PRIVATE_KEY_SIZE]> for SecretKey {
    fn from(secret: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(SSecretKey::from_bytes(&secret))
    }
}

impl Deref for SecretKey {
    type Target = SSecretKey;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SecretKey {
    /// Parse a secret key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PRIVATE_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff)
            .map_err(|_| KeyError::InvalidEncoding("private key hex".to_string()))?;
        Ok(Self::from(buff))
    }

    /// Generate a new random secret key using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
        Self::from(bytes)
    }

    /// Deterministically derive a child secret from this one
    pub fn derive(&self, context: &str, name: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(&self.to_bytes());
        hasher.update(name);
        Self::from(*hasher.finalize().as_bytes())
    }

    /// Derive the public key from this secret key
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public())
    }

    /// Convert secret key to raw bytes
    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Convert secret key to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Encode secret key in PEM format for secure storage
    ///
    /// Returns a PEM-encoded string with tag "PRIVATE KEY".
    pub fn to_pem(&self) -> String {
        let pem = pem::Pem::new("PRIVATE KEY", self.to_bytes());
        pem::encode(&pem)
    }

    /// Parse a secret key from PEM format
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The PEM string is malformed
    /// - The PEM tag is not "PRIVATE KEY"
    /// - The key size is incorrect
    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| KeyError::Pem(e.to_string()))?;

        if pem.tag() != "PRIVATE KEY" {
            return Err(KeyError::Pem(format!(
                "invalid PEM tag, expected PRIVATE KEY, got {}",
                pem.tag()
            )));
        }

        let bytes: [u8; PRIVATE_KEY_SIZE] =
            pem.contents()
                .try_into()
                .map_err(|_| KeyError::InvalidSize {
                    expected: PRIVATE_KEY_SIZE,
                    got: pem.contents().len(),
                })?;
        Ok(Self::from(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_textual_forms_normalize() {
        let key = SecretKey::generate().public();

        let from_hex: PublicKey = key.to_hex().parse().unwrap();
        let from_prefixed: PublicKey = format!("0x{}", key.to_hex()).parse().unwrap();
        let from_z32: PublicKey = key.to_z32().parse().unwrap();

        assert_eq!(from_hex, key);
        assert_eq!(from_prefixed, key);
        assert_eq!(from_z32, key);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            PublicKey::try_from(&b"not a key"[..]),
            Err(KeyError::InvalidSize { got: 9, .. })
        ));
        assert!("definitely-not-a-key".parse::<PublicKey>().is_err());
        assert!(!PublicKey::is_valid(&[0u8; 31]));
    }

    #[test]
    fn test_discovery_key_is_stable_and_distinct() {
        let a = SecretKey::generate().public();
        let b = SecretKey::generate().public();

        assert_eq!(a.discovery_key(), a.discovery_key());
        assert_ne!(a.discovery_key(), b.discovery_key());
        assert_ne!(a.discovery_key().as_bytes(), &a.to_bytes());
    }

    #[test]
    fn test_pem_serialization() {
        let private_key = SecretKey::generate();

        let pem = private_key.to_pem();
        let recovered_private = SecretKey::from_pem(&pem).unwrap();
        assert_eq!(private_key.to_bytes(), recovered_private.to_bytes());
        assert_eq!(
            private_key.public().to_bytes(),
            recovered_private.public().to_bytes()
        );
    }

    #[test]
    fn test_derive_is_deterministic() {
        let seed = SecretKey::generate();
        let a = seed.derive("test context", b"name");
        let b = seed.derive("test context", b"name");
        let c = seed.derive("test context", b"other");

        assert_eq!(a.public(), b.public());
        assert_ne!(a.public(), c.public());
    }
}
