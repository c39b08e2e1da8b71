//! unitd - unified CLI entrypoint.
//!
//! Usage:
//!   unitd start --config unitd.conf
//!   unitd topic 'key/a.b.c?ttl=3m' --wildcard

use anyhow::Result;
use clap::Parser;
use unitd::cli::commands::{run_start, run_topic};
use unitd::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Topic(args) => run_topic(args),
    }
}
