/// Configuration management for rumbo
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::topology::ServerAddress;

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seed addresses used to bootstrap topology discovery ("host:port")
    pub seeds: Vec<String>,
    /// Expected replica set name, if connecting to a replica set
    pub replica_set: Option<String>,
    /// Deployment sits behind a load balancer (single router, no discovery)
    #[serde(default)]
    pub load_balanced: bool,
    /// Monitoring configuration
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Server selection configuration
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Logical session configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Server monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between status probes in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Shorter backoff used to re-probe immediately after a failure
    pub min_heartbeat_interval_ms: u64,
}

/// Server selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Default timeout for selectServer calls in milliseconds
    pub server_selection_timeout_ms: u64,
    /// Latency window width in milliseconds (tolerance above the minimum)
    pub local_threshold_ms: u64,
}

/// Logical session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Fallback idle timeout in minutes when no server advertises one
    pub default_timeout_min: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            min_heartbeat_interval_ms: 500,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            server_selection_timeout_ms: 30_000,
            local_threshold_ms: 15,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_min: 30,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: vec!["127.0.0.1:27017".to_string()],
            replica_set: None,
            load_balanced: false,
            monitor: MonitorConfig::default(),
            selection: SelectionConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: ClusterConfig =
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
        if self.seeds.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one seed address is required".to_string(),
            ));
        }

        for seed in &self.seeds {
            seed.parse::<ServerAddress>().map_err(|_| {
                ConfigError::ValidationError(format!("invalid seed address: {}", seed))
            })?;
        }

        if self.load_balanced && self.seeds.len() != 1 {
            return Err(ConfigError::ValidationError(
                "load_balanced requires exactly one seed address".to_string(),
            ));
        }

        if self.monitor.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.min_heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "min_heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.min_heartbeat_interval_ms > self.monitor.heartbeat_interval_ms {
            return Err(ConfigError::ValidationError(
                "min_heartbeat_interval_ms must not exceed heartbeat_interval_ms".to_string(),
            ));
        }

        if self.selection.local_threshold_ms == 0 {
            return Err(ConfigError::ValidationError(
                "local_threshold_ms must be greater than 0".to_string(),
            ));
        }

        if self.session.default_timeout_min == 0 {
            return Err(ConfigError::ValidationError(
                "session default_timeout_min must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed seed addresses
    pub fn seed_addresses(&self) -> Vec<ServerAddress> {
        self.seeds
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Interval between status probes
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.heartbeat_interval_ms)
    }

    /// Backoff used when re-probing after a failure
    pub fn min_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.min_heartbeat_interval_ms)
    }

    /// Default selectServer timeout
    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection.server_selection_timeout_ms)
    }

    /// Latency window width
    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(self.selection.local_threshold_ms)
    }

    /// Fallback session idle timeout
    pub fn default_session_timeout(&self) -> Duration {
        Duration::from_secs(self.session.default_timeout_min * 60)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
