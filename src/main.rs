//! mx-ingress: inbound SMTP ingress.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                      MX INGRESS                       │
//!                      │                                                       │
//!   Sending MTA        │  ┌──────────┐   ┌─────────┐   ┌──────────────────┐   │
//!   ───────────────────┼─▶│ listener │──▶│  pool   │──▶│ session (per     │   │
//!                      │  │          │   │ tickets │   │ connection task) │   │
//!                      │  └──────────┘   └─────────┘   └────────┬─────────┘   │
//!                      │                                         │ envelope    │
//!                      │                                         ▼             │
//!                      │  ┌───────────┐   ┌─────────┐   ┌──────────────────┐   │
//!   Account directory ◀┼──│  resolve  │──▶│  quota  │──▶│     encrypt      │   │
//!                      │  └───────────┘   └─────────┘   └────────┬─────────┘   │
//!                      │                                         ▼             │
//!                      │                                  ┌─────────────┐      │
//!                      │                                  │  mail sink  │──────┼──▶ storage
//!                      │                                  └─────────────┘      │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use mx_ingress::config::{load_config, validate_config, ServerConfig};
use mx_ingress::lifecycle::{wait_for_signal, Shutdown};
use mx_ingress::observability::{logging, metrics};
use mx_ingress::{directory, DrainOutcome, Server, TracingSink};

#[derive(Debug, Parser)]
#[command(name = "mx-ingress", version, about = "Inbound SMTP ingress")]
struct Cli {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let config = ServerConfig::default();
            validate_config(&config).map_err(mx_ingress::config::ConfigError::Validation)?;
            config
        }
    };

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mx-ingress starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let directory = directory::from_config(&config.directory)?;
    let server = Server::bind(config, directory, Arc::new(TracingSink)).await?;

    let shutdown = Arc::new(Shutdown::new());
    let rx = shutdown.subscribe();
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.trigger();
        });
    }

    match server.run(rx).await {
        DrainOutcome::Drained => tracing::info!("Shutdown complete"),
        DrainOutcome::TimedOut { remaining } => {
            tracing::warn!(remaining, "Shutdown grace period elapsed with sessions still open")
        }
    }
    Ok(())
}
