mod cli;
mod cli_utils;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize structured logging
    incstate::logging::init(&cli.common.log_level);

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Exec(args) => commands::exec::run(&cli.common, args).await,
        Commands::State(args) => commands::state::run(&cli.common, &args).await,
    }
}
