//! On-disk application state
//!
//! ```text
//! ~/.rehoster/
//!   config.toml   index name, logging, optional rehost list
//!   key.pem       primary seed of the local log store
//!   logs/         persisted logs, one frame file per log
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use common::crypto::{KeyError, PublicKey, SecretKey};
use common::log::{LocalLog, LocalLogStore, LogError, LogStore};
use common::rehoster::DEFAULT_INDEX_NAME;
use common::store::{DesiredState, KeyedStore, RehostValue, StoreError};

pub const APP_NAME: &str = "rehoster";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const LOGS_DIR_NAME: &str = "logs";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("rehoster directory not found at {0}, run `rehoster init` first")]
    NotInitialized(PathBuf),
    #[error("rehoster directory already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("could not determine home directory")]
    NoHomeDirectory,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid key {key:?}: {source}")]
    InvalidKey { key: String, source: KeyError },
    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
    #[error("log store error: {0}")]
    Log(#[from] LogError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// One listed log, as written in config and sync files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RehostListing {
    /// Hex or z-base-32 public key
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A set of listings, the shape of a `rehoster sync` file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RehostList {
    #[serde(default)]
    pub rehost: Vec<RehostListing>,
}

impl RehostList {
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse every key. Duplicate keys keep the last listing.
    pub fn desired_state(&self) -> Result<DesiredState, StateError> {
        let mut desired = BTreeMap::new();
        for listing in &self.rehost {
            let key: PublicKey =
                listing
                    .key
                    .parse()
                    .map_err(|source| StateError::InvalidKey {
                        key: listing.key.clone(),
                        source,
                    })?;
            let value = RehostValue {
                description: listing.description.clone(),
                version: None,
            };
            desired.insert(key, value);
        }
        Ok(desired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Name of the writable log holding the rehost set
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for log files (stdout only if not set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// When present, the daemon syncs the rehost set to exactly this list on start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rehost: Option<Vec<RehostListing>>,
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            index_name: default_index_name(),
            log_level: default_log_level(),
            log_dir: None,
            rehost: None,
        }
    }
}

impl AppConfig {
    pub fn log_level(&self) -> Result<tracing::Level, StateError> {
        self.log_level
            .parse()
            .map_err(|_| StateError::InvalidLogLevel(self.log_level.clone()))
    }

    /// The configured rehost list, if the config pins one
    pub fn desired_state(&self) -> Result<Option<DesiredState>, StateError> {
        self.rehost
            .as_ref()
            .map(|rehost| {
                RehostList {
                    rehost: rehost.clone(),
                }
                .desired_state()
            })
            .transpose()
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the rehoster directory
    pub rehoster_dir: PathBuf,
    pub config: AppConfig,
    pub key_path: PathBuf,
    pub logs_path: PathBuf,
}

impl AppState {
    /// Default directory, `~/.rehoster`
    pub fn default_dir() -> Result<PathBuf, StateError> {
        dirs::home_dir()
            .map(|home| home.join(format!(".{}", APP_NAME)))
            .ok_or(StateError::NoHomeDirectory)
    }

    fn resolve_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        match custom_path {
            Some(path) => Ok(path),
            None => Self::default_dir(),
        }
    }

    /// Create the directory, a fresh primary key and a default config
    pub fn init(custom_path: Option<PathBuf>, config: AppConfig) -> Result<Self, StateError> {
        let rehoster_dir = Self::resolve_dir(custom_path)?;
        let config_path = rehoster_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Err(StateError::AlreadyInitialized(rehoster_dir));
        }

        let logs_path = rehoster_dir.join(LOGS_DIR_NAME);
        std::fs::create_dir_all(&logs_path)?;

        let key_path = rehoster_dir.join(KEY_FILE_NAME);
        if !key_path.exists() {
            std::fs::write(&key_path, SecretKey::generate().to_pem())?;
        }
        std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;

        Ok(Self {
            rehoster_dir,
            config,
            key_path,
            logs_path,
        })
    }

    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let rehoster_dir = Self::resolve_dir(custom_path)?;
        let config_path = rehoster_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::NotInitialized(rehoster_dir));
        }

        let raw = std::fs::read_to_string(&config_path)?;
        let config = toml::from_str(&raw).map_err(|source| StateError::Parse {
            path: config_path,
            source,
        })?;

        Ok(Self {
            key_path: rehoster_dir.join(KEY_FILE_NAME),
            logs_path: rehoster_dir.join(LOGS_DIR_NAME),
            rehoster_dir,
            config,
        })
    }

    pub fn load_key(&self) -> Result<SecretKey, StateError> {
        let pem = std::fs::read_to_string(&self.key_path)?;
        SecretKey::from_pem(&pem).map_err(|source| StateError::InvalidKey {
            key: self.key_path.display().to_string(),
            source,
        })
    }

    /// Public key of this rehoster's own index, derived without opening it
    pub async fn own_key(&self) -> Result<PublicKey, StateError> {
        Ok(self.open_logs().await?.named_key(&self.config.index_name))
    }

    pub async fn open_logs(&self) -> Result<LocalLogStore, StateError> {
        Ok(LocalLogStore::fs(&self.logs_path, self.load_key()?).await?)
    }

    /// Open the durable rehost set directly, without any network
    pub async fn open_store(&self) -> Result<KeyedStore<LocalLog>, StateError> {
        let logs = self.open_logs().await?;
        let log = logs.create(&self.config.index_name).await?;
        Ok(KeyedStore::open(log).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        let state = AppState::init(Some(path.clone()), AppConfig::default()).unwrap();
        assert!(state.key_path.exists());
        assert!(state.logs_path.is_dir());

        let loaded = AppState::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.config, AppConfig::default());
        assert_eq!(
            loaded.own_key().await.unwrap(),
            state.own_key().await.unwrap(),
            "own key must be stable across loads"
        );

        assert!(matches!(
            AppState::init(Some(path), AppConfig::default()),
            Err(StateError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn test_load_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppState::load(Some(dir.path().join("missing"))),
            Err(StateError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_config_parsing() {
        let key = SecretKey::generate().public();
        let raw = format!(
            r#"
            log_level = "debug"

            [[rehost]]
            key = "{}"
            description = "a log"

            [[rehost]]
            key = "{}"
            "#,
            key.to_hex(),
            key.to_z32()
        );
        let config: AppConfig = toml::from_str(&raw).unwrap();
        assert_eq!(config.index_name, DEFAULT_INDEX_NAME);
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        // both listings name the same key, the later one wins
        let desired = config.desired_state().unwrap().unwrap();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[&key].description, None);

        assert_eq!(AppConfig::default().desired_state().unwrap(), None);
    }

    #[test]
    fn test_invalid_listing_is_rejected() {
        let list = RehostList {
            rehost: vec![RehostListing {
                key: "not a key".to_string(),
                description: None,
            }],
        };
        assert!(matches!(
            list.desired_state(),
            Err(StateError::InvalidKey { .. })
        ));
    }
}
