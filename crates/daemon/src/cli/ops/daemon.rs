use clap::Args;

use rehoster_daemon::state::{AppState, StateError};
use rehoster_daemon::{spawn_service, ServiceConfig};

#[derive(Args, Debug, Clone)]
pub struct Daemon {
    /// Override the log level (default from config)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for log files (default from config, stdout only if neither is set)
    #[arg(long)]
    pub log_dir: Option<std::path::PathBuf>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut state = AppState::load(ctx.config_path.clone())?;
        if let Some(log_level) = &self.log_level {
            state.config.log_level = log_level.clone();
        }

        let config = ServiceConfig {
            secret: state.load_key()?,
            logs_path: state.logs_path.clone(),
            index_name: state.config.index_name.clone(),
            rehost: state.config.desired_state()?,
            log_level: state.config.log_level()?,
            log_dir: self.log_dir.clone().or(state.config.log_dir.clone()),
        };

        spawn_service(&config).await;
        Ok("daemon ended".to_string())
    }
}
