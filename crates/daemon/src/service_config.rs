use std::path::PathBuf;

use common::prelude::{DesiredState, SecretKey};

#[derive(Debug)]
pub struct Config {
    // log store configuration
    /// primary seed of the local log store,
    ///  named logs derive their keys from it
    pub secret: SecretKey,
    /// directory the local log store persists to
    pub logs_path: PathBuf,
    /// name of the writable log holding the rehost set
    pub index_name: String,

    /// when set, the rehost set is synced to exactly this on start
    pub rehost: Option<DesiredState>,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}
