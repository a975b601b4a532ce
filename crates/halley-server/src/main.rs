//! # Halley Server
//!
//! Bayeux publish/subscribe server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! halley
//!
//! # Run with a specific config file
//! halley --config /path/to/halley.toml
//!
//! # Override settings with environment variables
//! HALLEY__PORT=8080 HALLEY__ENGINE__MAX_QUEUE_SIZE=500 halley
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "halley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path() {
        Some(path) => config::Config::from_file(&path)
            .with_context(|| format!("Loading configuration from {path}"))?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Halley server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

/// The value following `--config` on the command line.
fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
    }
    None
}
