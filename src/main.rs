#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use threadrelay::config::{self, Config};
use threadrelay::store::{SqliteTopicStore, ThreadKey, TopicStore};
use threadrelay::{gateway, markdown, ConfigCommands, TopicCommands};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// `threadrelay` - Slack threads answered by your docs assistant.
#[derive(Parser, Debug)]
#[command(name = "threadrelay")]
#[command(version)]
#[command(about = "Relay Slack mentions to a docs assistant and answer in-thread.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: ~/.threadrelay)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the Slack Events API gateway
    Gateway {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Convert Markdown to Slack mrkdwn (reads stdin when FILE is omitted)
    Transcode {
        /// Markdown file to convert
        file: Option<PathBuf>,
    },

    /// Inspect or maintain the thread → topic store
    Topics {
        #[command(subcommand)]
        topic_command: TopicCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

async fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("Failed to read stdin")?;
            Ok(input)
        }
    }
}

async fn run_topics(config: &Config, command: TopicCommands) -> Result<()> {
    let store = SqliteTopicStore::open(&config.store_path())?;
    match command {
        TopicCommands::Get { channel, thread_ts } => {
            let key = ThreadKey::new(channel, thread_ts);
            match store.get(&key).await? {
                Some(topic_id) => println!("{topic_id}"),
                None => bail!("No live topic stored for {key}"),
            }
        }
        TopicCommands::Purge => {
            let purged = store.purge_expired().await?;
            println!(
                "Purged {purged} expired topic mapping(s) from {}",
                store.path().display()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for Rustls TLS.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    if cli
        .config_dir
        .as_ref()
        .is_some_and(|dir| dir.as_os_str().is_empty())
    {
        bail!("--config-dir cannot be empty");
    }

    // Offline commands keep stdout clean and never touch config.
    match &cli.command {
        Commands::Transcode { file } => {
            let input = read_input(file.as_deref()).await?;
            print!("{}", markdown::to_slack_mrkdwn(&input));
            return Ok(());
        }
        Commands::Config {
            config_command: ConfigCommands::Schema,
        } => {
            println!("{}", config::schema_json()?);
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load_or_init(cli.config_dir.as_deref()).await?;

    match cli.command {
        Commands::Gateway { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            if port == 0 {
                info!("Starting threadrelay gateway on {host} (random port)");
            } else {
                info!("Starting threadrelay gateway on {host}:{port}");
            }
            gateway::run_gateway(&host, port, config).await
        }

        Commands::Topics { topic_command } => run_topics(&config, topic_command).await,

        Commands::Transcode { .. } | Commands::Config { .. } => Ok(()),
    }
}
