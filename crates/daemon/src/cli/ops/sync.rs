use std::path::PathBuf;

use clap::Args;

use common::store::SyncOutcome;
use rehoster_daemon::state::{AppState, RehostList, StateError};

#[derive(Args, Debug, Clone)]
pub struct SyncFile {
    /// TOML file listing the complete rehost set as `[[rehost]]` tables
    pub file: PathBuf,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for SyncFile {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let desired = RehostList::load(&self.file)?.desired_state()?;
        let count = desired.len();

        let store = state.open_store().await?;
        let outcome = store.sync(desired).await?;
        store.close().await?;

        Ok(match outcome {
            SyncOutcome::Applied => format!("Rehost set synced to {} entries", count),
            SyncOutcome::Superseded => "Sync superseded by a later one".to_string(),
        })
    }
}
