/// Configuration management for the hub

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::error::ConfigError;

pub const DEFAULT_HUB_PORT: u16 = 4242;
pub const DEFAULT_AGENT_PORT: u16 = 8000;
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 3000;

/// Main hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hub server and agent fleet
    pub hub: HubSection,
    /// Mutual TLS material
    pub tls: TlsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Hub server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Port the hub listens on for callers
    pub port: u16,
    /// Port every agent listens on
    pub agent_port: u16,
    /// Hosts running an agent
    pub hostnames: Vec<String>,
    /// Directory for the hub's own logs
    pub log_dir: PathBuf,
    /// Name of the agent service
    pub service_name: String,
    /// Database installation root on every host
    pub gphome: PathBuf,
    /// Bound on a single agent dial in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

/// Certificate and key files for mutual TLS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (compact, full)
    pub format: String,
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub: HubSection {
                port: DEFAULT_HUB_PORT,
                agent_port: DEFAULT_AGENT_PORT,
                hostnames: vec!["localhost".to_string()],
                log_dir: PathBuf::from("/tmp"),
                service_name: "gp".to_string(),
                gphome: PathBuf::from("/usr/local/greenplum-db"),
                dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            },
            tls: TlsConfig {
                ca_cert: PathBuf::from("/etc/clusterhub/ca.crt"),
                server_cert: PathBuf::from("/etc/clusterhub/server.crt"),
                server_key: PathBuf::from("/etc/clusterhub/server.key"),
                client_cert: PathBuf::from("/etc/clusterhub/client.crt"),
                client_key: PathBuf::from("/etc/clusterhub/client.key"),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "compact".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.port == 0 {
            return Err(ConfigError::ValidationError(
                "hub port must be greater than 0".to_string(),
            ));
        }

        if self.hub.agent_port == 0 {
            return Err(ConfigError::ValidationError(
                "agent_port must be greater than 0".to_string(),
            ));
        }

        if self.hub.port == self.hub.agent_port {
            return Err(ConfigError::ValidationError(format!(
                "hub port and agent_port must differ, both are {}",
                self.hub.port
            )));
        }

        if self.hub.hostnames.is_empty() {
            return Err(ConfigError::ValidationError(
                "hostnames cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for host in &self.hub.hostnames {
            if host.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "empty hostname not allowed".to_string(),
                ));
            }
            if !seen.insert(host.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate hostname: {}",
                    host
                )));
            }
        }

        if self.hub.gphome.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "gphome cannot be empty".to_string(),
            ));
        }

        if self.hub.dial_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dial_timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "compact" | "full" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.hub.dial_timeout_ms)
    }

    /// Create example configuration file for the given hosts
    pub fn create_example_config<P: AsRef<Path>>(
        path: P,
        hostnames: Vec<String>,
    ) -> Result<(), ConfigError> {
        if hostnames.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one hostname is required".to_string(),
            ));
        }

        let mut config = Config::default();
        config.hub.hostnames = hostnames;
        config.validate()?;
        config.save_to_file(path)
    }
}
