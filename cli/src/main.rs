//! toolgate: MCP gateway aggregation layer.
//!
//! Three subcommands:
//! - `toolgate serve`: run the gateway (primary + fallback listeners, health probes)
//! - `toolgate bridge`: relay a stdio MCP client to a running gateway
//! - `toolgate check`: validate the config and print the source registry

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use toolgate::{BridgeCatalog, GatewayConfig, GatewayInstance, StdioBridge, Supervisor, shutdown_signal};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "toolgate.toml";

/// toolgate: one MCP endpoint in front of many tool sources.
#[derive(Parser)]
#[command(
    name = "toolgate",
    version,
    about = "toolgate: one MCP endpoint in front of many tool sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until SIGINT/SIGTERM
    Serve {
        /// Path to toolgate.toml [default: ./toolgate.toml or ~/.config/toolgate/toolgate.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Relay newline-delimited JSON-RPC between stdin/stdout and a running gateway
    Bridge {
        /// Gateway JSON-RPC endpoint
        #[arg(long, env = "TOOLGATE_URL", default_value = toolgate::standalone::stdio_bridge::DEFAULT_URL)]
        url: String,
        /// Key sent as X-API-Key
        #[arg(long, env = "TOOLGATE_API_KEY")]
        api_key: Option<String>,
        /// Per-request timeout in seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
    /// Validate the config and print the source registry
    Check {
        /// Path to toolgate.toml [default: ./toolgate.toml or ~/.config/toolgate/toolgate.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the bridge protocol; logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config } => run_serve(config, cancel).await,
        Commands::Bridge {
            url,
            api_key,
            timeout_secs,
        } => run_bridge(url, api_key, timeout_secs, cancel).await,
        Commands::Check { config } => run_check(config).await,
    }
}

/// Load config, probe sources, then serve until cancelled.
async fn run_serve(config_path: Option<PathBuf>, cancel: CancellationToken) -> Result<()> {
    let config = load_config(config_path).await?;
    let bridges = BridgeCatalog::from_config(&config.bridges).context("failed to set up internal bridges")?;
    let gateway = GatewayInstance::from_config(config, &bridges).context("failed to build gateway")?;
    let gateway = Arc::new(gateway);

    let tools = gateway.initialize().await;
    tracing::info!(
        sources = gateway.registry().len(),
        tools,
        "initial tool index built"
    );

    Supervisor::new(gateway, cancel)
        .run()
        .await
        .context("gateway stopped with an error")
}

/// Relay stdin to the gateway until EOF or a shutdown signal.
async fn run_bridge(url: String, api_key: Option<String>, timeout_secs: u64, cancel: CancellationToken) -> Result<()> {
    let bridge = StdioBridge::new(url, api_key, Duration::from_secs(timeout_secs))
        .context("failed to set up stdio bridge")?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    bridge
        .run(stdin, tokio::io::stdout(), cancel)
        .await
        .context("stdio bridge failed")
}

/// Validate the config and print one line per registered source.
async fn run_check(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path).await?;
    let bridges = BridgeCatalog::from_config(&config.bridges).context("failed to set up internal bridges")?;
    let gateway = GatewayInstance::from_config(config, &bridges).context("failed to build gateway")?;

    let registry = gateway.registry();
    println!("{} source(s) registered", registry.len());
    for source in registry.list() {
        let categories: Vec<&str> = source.categories.iter().map(String::as_str).collect();
        println!(
            "  {:<20} {:<16} {}  [{}]",
            source.id,
            source.kind().as_str(),
            source.address(),
            categories.join(", ")
        );
    }
    Ok(())
}

/// Resolve, read, and env-override the config; defaults when no file exists.
async fn load_config(explicit: Option<PathBuf>) -> Result<GatewayConfig> {
    let mut config = match resolve_config(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            GatewayConfig::load(&path)
                .await
                .with_context(|| format!("failed to load config {}", path.display()))?
        }
        None => {
            tracing::warn!("no {} found, starting with defaults", CONFIG_FILE);
            GatewayConfig::default()
        }
    };
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("invalid environment override")?;
    Ok(config)
}

/// Config path: explicit flag → ./toolgate.toml → ~/.config/toolgate/toolgate.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }

    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Some(local.to_path_buf());
    }

    dirs::config_dir()
        .map(|dir| dir.join("toolgate").join(CONFIG_FILE))
        .filter(|path| path.exists())
}
