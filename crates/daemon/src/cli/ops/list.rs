use clap::Args;

use common::store::ScannedEntry;
use rehoster_daemon::state::{AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct List;

#[async_trait::async_trait]
impl crate::cli::op::Op for List {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let store = state.open_store().await?;
        let entries = store.scan().await?;
        store.close().await?;

        if entries.is_empty() {
            return Ok("Not rehosting anything".to_string());
        }

        let lines: Vec<String> = entries
            .iter()
            .map(|entry| match entry {
                ScannedEntry::Valid { key, entry } => match &entry.description {
                    Some(description) => format!("{}  {}  {}", key, entry.version, description),
                    None => format!("{}  {}", key, entry.version),
                },
                ScannedEntry::InvalidKey { raw_key } => {
                    format!("<invalid key, {} bytes>", raw_key.len())
                }
                ScannedEntry::InvalidValue { key, error, .. } => {
                    format!("{}  <invalid entry: {}>", key, error)
                }
            })
            .collect();
        Ok(lines.join("\n"))
    }
}
