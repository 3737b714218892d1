mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use mediapool_core::{KeyPair, MediaNode};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "mediapool")]
#[command(about = "Replicated media file storage across a pool of servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Print a fresh key pair for ServerPrivateKey
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediapool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => run_server(&config).await,
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("ServerPrivateKey: {}", keys.secret_hex());
            println!("ServerPublicKey:  {}", keys.public_hex());
            Ok(())
        }
    }
}

async fn run_server(path: &str) -> anyhow::Result<()> {
    tracing::info!("Starting Mediapool server with config: {}", path);

    let node_config = Config::from_file(path)
        .and_then(Config::into_node_config)
        .with_context(|| format!("failed to load config {}", path))?;

    let node = MediaNode::builder(node_config)
        .build()
        .context("failed to assemble media node")?;
    let running = node.start().await.context("failed to start media node")?;
    tracing::info!(
        "Serving on {} with public key {}",
        running.local_addr(),
        running.public_key_hex()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    running.shutdown().await.context("shutdown failed")?;
    tracing::info!("Mediapool server stopped");
    Ok(())
}
