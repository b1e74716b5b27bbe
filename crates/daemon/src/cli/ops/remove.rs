use clap::Args;

use common::crypto::PublicKey;
use rehoster_daemon::state::{AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Remove {
    /// Public key of the log to stop rehosting
    pub key: PublicKey,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Remove {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let store = state.open_store().await?;
        let removed = store.delete(&self.key).await?;
        store.close().await?;

        Ok(if removed {
            format!("Stopped rehosting {}", self.key)
        } else {
            format!("{} was not being rehosted", self.key)
        })
    }
}
