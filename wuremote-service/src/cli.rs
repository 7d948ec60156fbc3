//! Command-line argument parsing.

use clap::Parser;
use wuremote_common::LogFormat;

/// WuRemote Service - remote control of the host update pipeline
#[derive(Parser, Debug)]
#[command(name = "wuremote-service")]
#[command(about = "WuRemote Service - remote control of the host update pipeline")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "WUREMOTE_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Listen address for the HTTP/WebSocket host
    #[arg(long)]
    pub listen: Option<String>,

    /// Disable the HTTP/WebSocket host
    #[arg(long)]
    pub no_http: bool,

    /// Report this FQDN instead of the detected host name
    #[arg(long)]
    pub fqdn: Option<String>,

    /// Search timeout in seconds
    #[arg(long)]
    pub search_timeout: Option<u32>,

    /// Download timeout in seconds
    #[arg(long)]
    pub download_timeout: Option<u32>,

    /// Install timeout in seconds
    #[arg(long)]
    pub install_timeout: Option<u32>,
}
