//! ollama-bridge - relays requests from a remote WebSocket proxy to Ollama.
//!
//! Keeps a persistent connection to the proxy, runs each incoming prompt
//! through a local Ollama model and sends the answer back, either in one piece
//! or streamed fragment by fragment.

mod bridge;
mod config;
mod context;
mod error;
mod logging;
mod protocol;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Endpoint, SetupOverrides, StdinPrompter, StoredConfig};
use context::BridgeContext;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ollama-bridge")]
#[command(author, version, about = "Relays requests from a remote WebSocket proxy to Ollama")]
struct Cli {
    /// WebSocket server port
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// WebSocket server host
    #[arg(long, default_value = config::DEFAULT_HOST)]
    host: String,

    /// WebSocket connection path
    #[arg(long, default_value = config::DEFAULT_PATH)]
    path: String,

    /// Connect with plain ws:// instead of wss://
    #[arg(long)]
    insecure_ws: bool,

    /// Base delay in seconds between reconnect attempts (grows linearly, capped at 60)
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    reconnect_delay: u64,

    /// Enable verbose logging
    #[arg(long)]
    test: bool,

    /// Enable debug messages
    #[arg(long)]
    debug: bool,

    /// Force the setup prompts even if a configuration exists
    #[arg(long)]
    setup: bool,

    /// Auth token for the WebSocket connection
    #[arg(long)]
    token: Option<String>,

    /// Ollama model to use
    #[arg(long)]
    model: Option<String>,

    /// Ollama API host
    #[arg(long, value_name = "HOST")]
    ollama_host: Option<String>,

    /// Ollama API port
    #[arg(long, value_name = "PORT")]
    ollama_port: Option<u16>,

    /// Show the current configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_dir = Config::log_dir().ok();
    logging::init_logging(cli.debug || cli.test, log_dir.as_deref());

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    info!("Application finished");
}

async fn run(cli: Cli) -> Result<()> {
    let mut endpoint = Endpoint::new(cli.host, cli.port, cli.path);
    if cli.insecure_ws {
        endpoint = endpoint.insecure();
    }

    let config_path = Config::config_path()?;
    let stored = StoredConfig::load_or_default(&config_path);

    if cli.show_config {
        println!("{}", config::describe(&stored, &endpoint));
        return Ok(());
    }

    let overrides = SetupOverrides {
        token: cli.token,
        model: cli.model,
        ollama_host: cli.ollama_host,
        ollama_port: cli.ollama_port,
    };
    let (config, changed) = config::setup(&stored, overrides, cli.setup, &mut StdinPrompter)
        .context("Setup failed")?;

    if changed {
        StoredConfig::from(&config).save_to(&config_path)?;
        info!("Configuration saved to {}", config_path.display());
        info!("Server: {}", endpoint.base_uri());
        info!("Ollama model: {}", config.model);
        info!("Ollama API server: {}", config.ollama_url());
    }

    let ctx = BridgeContext::new(config, endpoint)
        .with_reconnect_base_delay(Duration::from_secs(cli.reconnect_delay));
    bridge::ProxyClient::new(ctx).run().await
}
