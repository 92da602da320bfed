//! # Herald Server
//!
//! Realtime presence and notification delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with custom config
//! herald --config /path/to/herald.toml
//!
//! # Run with environment variables
//! HERALD_PORT=8080 HERALD_HOST=0.0.0.0 herald
//! ```

mod config;
mod handlers;
mod metrics;
mod transports;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,herald_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (None, _) => config::Config::load()?,
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (Some(arg), _) => bail!("Unexpected argument: {arg} (usage: herald [--config <path>])"),
    };

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
