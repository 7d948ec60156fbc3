//! Configuration management for the WuRemote service.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use wuremote_agent::DEFAULT_SEARCH_CRITERIA;

use crate::cli::Args;
use crate::update::Settings;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wuremote/service.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP/WebSocket host configuration
    pub server: ServerConfig,
    /// Host identification
    pub node: NodeConfig,
    /// Update agent backend configuration
    pub agent: AgentConfig,
    /// Phase timeouts and automation flags
    pub settings: Settings,
    /// Observer delivery configuration
    pub observers: ObserverConfig,
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

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if args.no_http {
            self.server.enable_http = false;
        }

        if let Some(ref fqdn) = args.fqdn {
            self.node.fqdn = Some(fqdn.clone());
        }

        if let Some(secs) = args.search_timeout {
            self.settings.search_timeout_secs = secs;
        }
        if let Some(secs) = args.download_timeout {
            self.settings.download_timeout_secs = secs;
        }
        if let Some(secs) = args.install_timeout {
            self.settings.install_timeout_secs = secs;
        }

        self
    }

    /// Defaults with CLI overrides applied.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.settings
            .validate()
            .context("Invalid settings section")?;

        self.server
            .listen_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_address))?;

        if self.observers.delivery_timeout_ms == 0 {
            anyhow::bail!("observers.delivery_timeout_ms must be positive");
        }

        Ok(())
    }
}

/// HTTP/WebSocket host configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Serve the HTTP API and callback socket
    pub enable_http: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8086".to_string(),
            enable_http: true,
        }
    }
}

/// Host identification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// FQDN reported to clients (detected if not set)
    pub fqdn: Option<String>,
}

/// Update agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Backend type
    pub backend: AgentBackend,
    /// Criteria passed to every search
    pub search_criteria: String,
    /// Simulation parameters of the mock backend
    pub mock: MockAgentConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: AgentBackend::Mock,
            search_criteria: DEFAULT_SEARCH_CRITERIA.to_string(),
            mock: MockAgentConfig::default(),
        }
    }
}

/// Update agent backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentBackend {
    /// In-memory simulated agent
    #[default]
    Mock,
}

/// Mock backend simulation parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockAgentConfig {
    /// Delay between progress signals in milliseconds
    pub step_delay_ms: u64,
    /// Progress signals per job
    pub steps: usize,
    /// Number of simulated pending updates
    pub catalog_size: usize,
    /// Simulated installs ask for a restart
    pub install_requires_reboot: bool,
}

impl Default for MockAgentConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: 500,
            steps: 10,
            catalog_size: 4,
            install_requires_reboot: false,
        }
    }
}

/// Observer delivery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Upper bound for a single event delivery in milliseconds
    pub delivery_timeout_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.server.enable_http);
        assert_eq!(config.agent.backend, AgentBackend::Mock);
    }

    #[test]
    fn test_partial_yaml() {
        let config = Config::from_yaml(
            r#"
server:
  listen_address: "127.0.0.1:9999"
node:
  fqdn: host.example.org
settings:
  search_timeout_secs: 5
  auto_select_updates: true
agent:
  mock:
    catalog_size: 8
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen_address, "127.0.0.1:9999");
        assert_eq!(config.node.fqdn.as_deref(), Some("host.example.org"));
        assert_eq!(config.settings.search_timeout_secs, 5);
        assert_eq!(config.settings.download_timeout_secs, 3600);
        assert!(config.settings.auto_select_updates);
        assert_eq!(config.agent.mock.catalog_size, 8);
        assert_eq!(config.agent.mock.steps, 10);
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = Config::from_yaml("settings:\n  install_timeout_secs: 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("install_timeout"));
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "wuremote-service",
            "--no-http",
            "--fqdn",
            "override.local",
            "--install-timeout",
            "99",
        ]);
        let config = Config::default_with_cli(&args);
        assert!(!config.server.enable_http);
        assert_eq!(config.node.fqdn.as_deref(), Some("override.local"));
        assert_eq!(config.settings.install_timeout_secs, 99);
    }
}
