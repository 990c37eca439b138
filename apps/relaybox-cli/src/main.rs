//! relaybox entry point.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaybox")]
#[command(about = "Encrypted, chunked file storage on a chat-bot document backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.config/relaybox/relaybox.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep chunks in memory instead of the remote backend
    #[arg(long, global = true)]
    memory: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one file and write its manifest
    Upload {
        path: PathBuf,

        /// Manifest output path (default: <path>.relaybox.json)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Rebuild a file from its manifest
    Download { manifest: PathBuf, out: PathBuf },

    /// Upload several files through the bounded transfer queue
    Batch {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Create or update the config file
    Init {
        #[arg(long)]
        bot_token: Option<String>,

        #[arg(long)]
        chat_id: Option<String>,

        /// Hex (or raw) secret mixed into every chunk key
        #[arg(long)]
        server_secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relaybox=debug")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting relaybox");

    if let Commands::Init {
        bot_token,
        chat_id,
        server_secret,
    } = cli.command
    {
        let path = cli.config.unwrap_or_else(config::config_path);
        return commands::init(&path, bot_token, chat_id, server_secret);
    }

    let config = config::RelayConfig::load(cli.config.as_deref())?;
    let ctx = commands::Context::new(&config, cli.memory)?;

    match cli.command {
        Commands::Upload { path, manifest } => commands::upload(&ctx, &path, manifest).await,
        Commands::Download { manifest, out } => commands::download(&ctx, &manifest, &out).await,
        Commands::Batch { paths } => commands::batch(&ctx, &config, &paths).await,
        // Handled before the backend is built.
        Commands::Init { .. } => Ok(()),
    }
}
