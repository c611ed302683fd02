#![cfg_attr(not(test), forbid(unsafe_code))]

//! Entry point for the livetail server binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;

/// Main CLI structure for the livetail server.
#[derive(Debug, Parser)]
#[command(name = "livetail-server")]
#[command(about = "Backlog-then-live tail and chat streaming server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind; overrides the configuration file and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Configuration file (yaml, json or toml)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => {
            let config = Config::load_config(config, port)?;
            server::server::run(config).await
        }
    }
}
