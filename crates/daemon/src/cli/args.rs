pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rehoster")]
#[command(about = "Keep a set of logs, and everything they lead to, replicated")]
pub struct Args {
    /// Path to the rehoster directory (defaults to ~/.rehoster)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
