//! # Chatter Server
//!
//! Realtime chat presence and message routing server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a chatter.toml from the default search paths
//! chatter
//!
//! # Run with custom config
//! chatter --config /path/to/chatter.toml
//!
//! # Run with environment variables
//! CHATTER_PORT=8080 CHATTER_HOST=0.0.0.0 CHATTER_AUTH__JWT_SECRET=... chatter
//! ```

use anyhow::Result;
use chatter_server::{config::Config, handlers, metrics};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "chatter_core=debug,chatter_server=debug";

/// Realtime chat presence and message routing server.
#[derive(Debug, Parser)]
#[command(name = "chatter", version)]
struct Args {
    /// Config file to load instead of searching the default paths.
    /// Environment overrides are not applied to an explicit file.
    #[arg(short, long, env = "CHATTER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    tracing::info!("Starting Chatter server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_flag_selects_file() {
        let args = Args::try_parse_from(["chatter", "--config", "/etc/chatter/alt.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/chatter/alt.toml")));

        let args = Args::try_parse_from(["chatter", "-c", "local.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("local.toml")));
    }

    #[test]
    fn test_default_filter_covers_workspace_crates() {
        let filter = tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("chatter_core=debug"));
        assert!(rendered.contains("chatter_server=debug"));
    }
}
