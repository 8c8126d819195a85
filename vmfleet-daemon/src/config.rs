//! Configuration management for the daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use vmfleet_provider::ProviderConfig;

use crate::cli::Args;

/// Location searched when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmfleet/daemon.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Backend served by this daemon
    pub provider: ProviderSettings,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Defaults plus whatever the command line sets.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref gateway) = args.gateway_listen {
            self.server.gateway_address = gateway.clone();
        }

        if let Some(ref provider) = args.provider {
            self.provider.name = provider.clone();
        }

        if let Some(ref home) = args.home {
            self.provider.home = Some(PathBuf::from(home));
        }

        self
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gRPC server binds
    pub listen_address: String,
    /// Address the HTTP/JSON gateway binds
    pub gateway_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            gateway_address: "0.0.0.0:8090".to_string(),
        }
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Registry name of the backend
    pub name: String,
    /// State directory (defaults to `~/.vmfleet`)
    pub home: Option<PathBuf>,
    /// Settings handed to the backend at initialization
    pub cloud: ProviderConfig,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: "onprem".to_string(),
            home: None,
            cloud: ProviderConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_address, "0.0.0.0:8080");
        assert_eq!(config.server.gateway_address, "0.0.0.0:8090");
        assert_eq!(config.provider.name, "onprem");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::parse(
            "provider:\n  name: vbox\n  cloud:\n    image_name: web\nserver:\n  gateway_address: 127.0.0.1:9000\n",
        )
        .unwrap();
        assert_eq!(config.provider.name, "vbox");
        assert_eq!(config.provider.cloud.image_name, "web");
        assert_eq!(config.server.gateway_address, "127.0.0.1:9000");
        assert_eq!(config.server.listen_address, "0.0.0.0:8080");
    }

    #[test]
    fn test_cli_overrides_win() {
        let args = Args::parse_from([
            "vmfleet-daemon",
            "--listen",
            "127.0.0.1:7000",
            "--provider",
            "bhyve",
            "--home",
            "/var/lib/vmfleet",
        ]);
        let config = Config::default_with_cli(&args);
        assert_eq!(config.server.listen_address, "127.0.0.1:7000");
        assert_eq!(config.server.gateway_address, "0.0.0.0:8090");
        assert_eq!(config.provider.name, "bhyve");
        assert_eq!(config.provider.home, Some(PathBuf::from("/var/lib/vmfleet")));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Config::load(dir.path().join("absent.yaml")).is_err());
    }
}
