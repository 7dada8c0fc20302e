//! Bridge configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) is a
//! valid configuration. Durations are integer milliseconds.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Datagram telemetry feed.
    pub udp_listen: SocketAddr,
    /// WebSocket listener for hardware and observers.
    pub ws_listen: SocketAddr,
    pub command_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub hardware_check_interval_ms: u64,
    pub subsystem_check_interval_ms: u64,
    /// Per-connection outbound queue length.
    pub outbox_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Put the correlation key into forwarded commands as `id`.
    pub attach_correlation_id: bool,
    pub subsystems: Vec<SubsystemConfig>,
}

/// What to do when a connection's outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Close the stalled connection.
    #[default]
    Disconnect,
    /// Drop the message for that connection only.
    DropNewest,
}

/// A named subsystem recognized by a marker in hardware log text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemConfig {
    pub name: String,
    pub marker: String,
}

impl SubsystemConfig {
    pub fn new(name: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            marker: marker.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            udp_listen: ([0, 0, 0, 0], 10015).into(),
            ws_listen: ([127, 0, 0, 1], 8765).into(),
            command_timeout_ms: 10_000,
            heartbeat_timeout_ms: 15_000,
            hardware_check_interval_ms: 1_000,
            subsystem_check_interval_ms: 5_000,
            outbox_capacity: 256,
            overflow_policy: OverflowPolicy::Disconnect,
            attach_correlation_id: true,
            subsystems: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("command_timeout_ms", self.command_timeout_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("hardware_check_interval_ms", self.hardware_check_interval_ms),
            ("subsystem_check_interval_ms", self.subsystem_check_interval_ms),
            ("outbox_capacity", self.outbox_capacity as u64),
        ];
        match checks.into_iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Zero(name)),
            None => Ok(()),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn hardware_check_interval(&self) -> Duration {
        Duration::from_millis(self.hardware_check_interval_ms)
    }

    pub fn subsystem_check_interval(&self) -> Duration {
        Duration::from_millis(self.subsystem_check_interval_ms)
    }
}

impl std::str::FromStr for BridgeConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
