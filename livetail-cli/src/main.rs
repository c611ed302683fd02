#![cfg_attr(not(test), forbid(unsafe_code))]

//! `livetail` command-line interface.

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use shared::{
    config::server::Config,
    models::{TailKind, TailQuery},
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod commands;

use commands::config::ConfigFormat;

#[derive(Debug, Parser)]
#[command(name = "livetail", version)]
#[command(about = "Backlog-then-live tails and resumable chat streams", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TailTarget {
    Logs,
    Conversations,
}

impl From<TailTarget> for TailKind {
    fn from(target: TailTarget) -> Self {
        match target {
            TailTarget::Logs => Self::Logs,
            TailTarget::Conversations => Self::Conversations,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the livetail server
    Serve {
        /// Port to bind; overrides the configuration file and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Server configuration file (yaml, json or toml)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Follow an admin tail: the matching backlog, then live records
    Tail {
        #[arg(value_enum)]
        kind: TailTarget,

        /// Case-insensitive text matched against several fields
        #[arg(long, short)]
        search: Option<String>,

        /// 1-based backlog page
        #[arg(long)]
        page: Option<u32>,

        /// Backlog records per page
        #[arg(long, short)]
        limit: Option<u32>,

        /// Fetch the whole matching backlog
        #[arg(long)]
        all: bool,

        /// Restrict a conversation tail to one conversation
        #[arg(long)]
        conversation: Option<String>,

        /// Reconnect attempts after the stream ends
        #[arg(long, default_value_t = 3)]
        reconnects: u32,

        /// Client configuration file (toml)
        #[arg(long)]
        client_config: Option<PathBuf>,
    },

    /// Send a prompt and stream the reply
    Chat {
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<Uuid>,

        /// Prompt text
        #[arg(long, short)]
        text: String,

        /// Detach after this many milliseconds, then reattach to the same
        /// generation
        #[arg(long)]
        detach_after: Option<u64>,

        /// Client configuration file (toml)
        #[arg(long)]
        client_config: Option<PathBuf>,
    },

    /// Print the OpenAPI document as JSON
    Spec {
        /// Write to this file instead of stdout
        output: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completion {
        #[arg(long, short, value_enum)]
        shell: clap_complete::Shell,
    },

    /// Write a default server configuration file
    Config {
        #[arg(long, short, value_enum, default_value_t = ConfigFormat::Yaml)]
        format: ConfigFormat,

        /// Destination; defaults to `livetail.<format>` in the current directory
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

/// Client-side logging goes to stderr so stdout stays machine-readable.
fn initialize_client_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
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
        Commands::Tail {
            kind,
            search,
            page,
            limit,
            all,
            conversation,
            reconnects,
            client_config,
        } => {
            initialize_client_tracing();
            let query = TailQuery {
                search,
                page,
                limit,
                all,
                conversation_id: conversation,
            };
            commands::tail::run_tail(kind.into(), query, reconnects, client_config).await
        }
        Commands::Chat {
            conversation,
            text,
            detach_after,
            client_config,
        } => {
            initialize_client_tracing();
            commands::chat::run_chat(
                conversation,
                text,
                detach_after.map(Duration::from_millis),
                client_config,
            )
            .await
        }
        Commands::Spec { output } => commands::spec::generate_spec(output.as_deref()),
        Commands::Completion { shell } => {
            commands::completion::generate_completion(shell);
            Ok(())
        }
        Commands::Config { format, output } => {
            commands::config::generate_config(format, output.as_deref())
        }
    }
}
