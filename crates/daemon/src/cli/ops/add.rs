use clap::Args;

use common::crypto::PublicKey;
use common::store::RehostValue;
use rehoster_daemon::state::{AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Add {
    /// Public key of the log to rehost, hex or z-base-32
    pub key: PublicKey,

    /// Free-form note stored alongside the key
    #[arg(long)]
    pub description: Option<String>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Add {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let store = state.open_store().await?;
        let value = RehostValue {
            description: self.description.clone(),
            version: None,
        };
        let written = store.add(self.key, value).await?;
        store.close().await?;

        Ok(if written {
            format!("Rehosting {}", self.key)
        } else {
            format!("Already rehosting {}", self.key)
        })
    }
}
