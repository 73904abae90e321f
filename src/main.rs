//! WTVP session server.
//!
//! Serves WebTV-protocol clients: binary-over-TCP request frames, RC4 stream
//! encryption negotiated per connection, and static service content.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────────┐
//!                     │                     WTVP SERVER                          │
//!                     │                                                          │
//!   Client frame      │  ┌─────────┐   ┌──────────┐   ┌────────────┐             │
//!   ──────────────────┼─▶│   net   │──▶│ framing  │──▶│ negotiator │             │
//!                     │  │listener │   │assembler │   │  (crypto)  │             │
//!                     │  └─────────┘   └──────────┘   └─────┬──────┘             │
//!                     │                                     │                    │
//!                     │                                     ▼                    │
//!   Client response   │  ┌──────────┐                 ┌────────────┐  ┌───────┐  │
//!   ◀─────────────────┼──│ response │◀────────────────│ dispatcher │─▶│ vault │  │
//!                     │  │ encoder  │                 │ + handlers │  └───────┘  │
//!                     │  └──────────┘                 └────────────┘             │
//!                     │                                                          │
//!                     │  ┌────────────────────────────────────────────────────┐  │
//!                     │  │  config + watcher │ session registry │ lifecycle   │  │
//!                     │  │  observability (tracing, metrics)                  │  │
//!                     │  └────────────────────────────────────────────────────┘  │
//!                     └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use wtvp_server::config::{load_config, ConfigWatcher, ServerConfig};
use wtvp_server::lifecycle::{wait_for_shutdown_signal, Shutdown};
use wtvp_server::observability::{logging, metrics};
use wtvp_server::{SessionRegistry, WtvpServer};

#[derive(Parser, Debug)]
#[command(name = "wtvp-server")]
#[command(about = "WTVP session server", long_about = None)]
struct Args {
    /// Configuration file (TOML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level; overrides the configured one. `RUST_LOG` overrides both.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.observability.log_level.clone());
    logging::init_logging(&level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "wtvp-server starting");
    tracing::info!(
        service_ip = %config.server.service_ip,
        bind_host = %config.server.bind_host,
        services = config.services.len(),
        framing = ?config.framing.strategy,
        vault = ?config.vault.root,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let registry = match &config.registry.persistence_path {
        Some(path) => SessionRegistry::load_from_file(path)?,
        None => SessionRegistry::new(None),
    };

    let server = WtvpServer::new(config, registry);

    // Keep the watcher alive for the life of the process.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => {
                    let server = server.clone();
                    tokio::spawn(async move { server.watch_config(updates).await });
                    Some(handle)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload unavailable");
                    None
                }
            }
        }
        None => None,
    };

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let signal = wait_for_shutdown_signal().await;
            tracing::info!(signal, "Shutdown signal received");
            shutdown.trigger();
        });
    }

    server.run(&shutdown).await?;
    server.drain().await;

    if let Err(e) = server.registry().save_to_file() {
        tracing::error!(error = %e, "Failed to save client identities");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
