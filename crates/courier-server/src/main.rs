//! # Courier Server
//!
//! Real-time delivery for two-party chat.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory store)
//! courier
//!
//! # Persist messages with sled
//! COURIER__STORE__BACKEND=sled COURIER__STORE__PATH=/var/lib/courier courier
//!
//! # Explicit config file
//! courier --config /path/to/courier.toml
//! COURIER_CONFIG=/path/to/courier.toml courier
//!
//! # Listen address
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 courier
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;
mod sled_store;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Real-time delivery server for two-party chat")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match args.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
