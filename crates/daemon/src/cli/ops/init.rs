use clap::Args;

use rehoster_daemon::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Name of the writable log holding the rehost set
    #[arg(long)]
    pub index_name: Option<String>,

    /// Default log level for the daemon
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for daemon log files
    #[arg(long)]
    pub log_dir: Option<std::path::PathBuf>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = AppConfig::default();
        if let Some(index_name) = &self.index_name {
            config.index_name = index_name.clone();
        }
        if let Some(log_level) = &self.log_level {
            config.log_level = log_level.clone();
        }
        config.log_level()?;
        config.log_dir = self.log_dir.clone();

        let state = AppState::init(ctx.config_path.clone(), config)?;
        let own_key = state.own_key().await?;

        Ok(format!(
            "Initialized rehoster directory at: {}\n\
             - Config: {}\n\
             - Key: {}\n\
             - Logs: {}\n\
             Own key: {}",
            state.rehoster_dir.display(),
            state
                .rehoster_dir
                .join(rehoster_daemon::state::CONFIG_FILE_NAME)
                .display(),
            state.key_path.display(),
            state.logs_path.display(),
            own_key,
        ))
    }
}
