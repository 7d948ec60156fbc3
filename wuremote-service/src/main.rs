//! # WuRemote Service
//!
//! Runs on the managed host and lets remote clients drive its update
//! pipeline: search, download and install, with per-phase timeouts and
//! live state/progress callbacks.
//!
//! ## Usage
//! ```bash
//! wuremote-service --config /etc/wuremote/service.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use wuremote_common::init_logging_with_format;
use wuremote_service::cli::Args;
use wuremote_service::config::{Config, DEFAULT_CONFIG_PATH};
use wuremote_service::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging_with_format(&args.log_level, args.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting WuRemote service"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default_with_cli(&args)
            }
        },
    };
    config.validate()?;

    info!(
        listen = %config.server.listen_address,
        http = config.server.enable_http,
        agent = ?config.agent.backend,
        "Service configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Service failed");
        return Err(e);
    }

    Ok(())
}
