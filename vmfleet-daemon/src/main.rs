//! # vmfleet Daemon
//!
//! Serves one provider's instances, images and volumes over gRPC and a
//! JSON/HTTP gateway that forwards to the gRPC server over loopback.
//!
//! ## Usage
//! ```bash
//! vmfleet-daemon --config /etc/vmfleet/daemon.yaml
//! curl http://localhost:8090/v1/instances
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod gateway;
mod server;
mod service;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    vmfleet_common::logging::init(args.log_format, &args.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting vmfleet daemon"
    );

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

    info!(
        listen = %config.server.listen_address,
        gateway = %config.server.gateway_address,
        provider = %config.provider.name,
        "Daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
