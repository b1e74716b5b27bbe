use clap::Args;

use rehoster_daemon::state::{AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Info;

#[async_trait::async_trait]
impl crate::cli::op::Op for Info {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let own_key = state.own_key().await?;

        Ok(format!(
            "Directory: {}\n\
             Index name: {}\n\
             Own key: {}\n\
             Discovery key: {}",
            state.rehoster_dir.display(),
            state.config.index_name,
            own_key,
            own_key.discovery_key(),
        ))
    }
}
