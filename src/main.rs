//! Caching forward HTTP proxy.
//!
//! ```text
//!   client ──▶ listener ──▶ handler task ──┬─▶ cache hit ─────────────▶ client
//!                                          └─▶ origin ──▶ relay ──────▶ client
//!                                                           └─▶ capture ─▶ cache
//! ```
//!
//! Usage: `caching-proxy <PORT> [--config <FILE>]`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use caching_proxy::config::{self, ProxyConfig};
use caching_proxy::lifecycle::{signals, Shutdown};
use caching_proxy::net::Listener;
use caching_proxy::observability::{logging, metrics};
use caching_proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "caching-proxy")]
#[command(about = "Concurrent forwarding HTTP proxy with an LRU response cache", long_about = None)]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };
    config.listener.port = cli.port;

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "caching-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = match Listener::bind(&config.listener).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Bind failed");
            eprintln!("Failed to listen on port: {}", cli.port);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    signals::spawn_signal_handler(shutdown);

    let server = ProxyServer::new(&config);
    if let Err(e) = server.run(listener, server_shutdown).await {
        tracing::error!(error = %e, "Server failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
