use std::sync::Arc;

use common::log::LocalLogStore;
use common::prelude::{MemoryNetwork, Rehoster, RehosterConfig, RehosterError, Swarm};
use common::store::SyncOutcome;

use crate::ServiceConfig;

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("failed to open log store: {0}")]
    Logs(#[from] common::log::LogError),
    #[error("failed to open rehoster: {0}")]
    Rehoster(#[from] RehosterError),
}

/// Everything the running service shares between its tasks
#[derive(Debug, Clone)]
pub struct State {
    rehoster: Arc<Rehoster<LocalLogStore>>,
    network: MemoryNetwork,
}

impl State {
    pub async fn from_config(config: &ServiceConfig) -> Result<Self, StateSetupError> {
        let logs = LocalLogStore::fs(&config.logs_path, config.secret.clone()).await?;

        let network = MemoryNetwork::new();
        let swarm: Arc<dyn Swarm> = Arc::new(network.swarm(&logs));
        let rehoster = Rehoster::open(
            logs,
            swarm,
            RehosterConfig {
                index_name: config.index_name.clone(),
            },
        )
        .await?;

        if let Some(desired) = &config.rehost {
            let entries = desired.len();
            match rehoster.sync(desired.clone()).await? {
                SyncOutcome::Applied => tracing::info!(entries, "rehost set synced from config"),
                SyncOutcome::Superseded => tracing::warn!("config sync superseded"),
            }
        }

        Ok(Self {
            rehoster: Arc::new(rehoster),
            network,
        })
    }

    pub fn rehoster(&self) -> &Arc<Rehoster<LocalLogStore>> {
        &self.rehoster
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}
