// CLI modules
mod cli;

use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, Add, Daemon, Info, Init, List, Remove, SyncFile, Version};

command_enum! {
    (Add, Add),
    (Daemon, Daemon),
    (Info, Info),
    (Init, Init),
    (List, List),
    (Remove, Remove),
    (Sync, SyncFile),
    (Version, Version),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let ctx = cli::op::OpContext::new(args.config_path);

    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
