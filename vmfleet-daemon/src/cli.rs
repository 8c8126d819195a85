//! Command-line argument parsing.

use clap::Parser;
use vmfleet_common::LogFormat;

/// vmfleet Daemon - serves one provider's instances, images and volumes
#[derive(Parser, Debug)]
#[command(name = "vmfleet-daemon")]
#[command(about = "vmfleet Daemon - serves one provider's instances, images and volumes")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Listen address for the gRPC server
    #[arg(long)]
    pub listen: Option<String>,

    /// Listen address for the HTTP/JSON gateway
    #[arg(long)]
    pub gateway_listen: Option<String>,

    /// Provider to serve (onprem, bhyve, vbox, openstack)
    #[arg(long, env = "VMFLEET_PROVIDER")]
    pub provider: Option<String>,

    /// State directory holding images, instances and volumes
    #[arg(long, env = "VMFLEET_HOME")]
    pub home: Option<String>,
}
