//! Command-line interface.

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "unitd", about = "Topic-based publish/subscribe message broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the broker.
    Start(StartArgs),
    /// Parse a topic expression and print its routing parts.
    Topic(TopicArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Path to the config file.
    #[arg(long, short = 'c', default_value = "unitd.conf")]
    pub config: PathBuf,
    /// Override the address and port to listen on.
    #[arg(long)]
    pub listen: Option<String>,
    /// Override the name of the current cluster node.
    #[arg(long)]
    pub cluster_self: Option<String>,
    /// Override the runtime stats endpoint path.
    #[arg(long)]
    pub varz: Option<String>,
}

#[derive(Debug, Args)]
pub struct TopicArgs {
    /// Topic expression, e.g. `key/a.b.c?ttl=3m`.
    pub expr: String,
    /// Contract id used as the hash salt.
    #[arg(long, default_value_t = 0)]
    pub contract: u32,
    /// Parse with wildcard semantics, as a subscription would.
    #[arg(long)]
    pub wildcard: bool,
}
