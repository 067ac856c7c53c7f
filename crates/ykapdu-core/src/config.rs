//! Connection configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::apdu::DEFAULT_MAX_GET_RESPONSE_ROUNDS;

/// Timeouts and protocol options for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bounded wait for `start_blocking`.
    pub start_timeout_ms: u64,
    /// Bounded wait for `stop_blocking`.
    pub stop_timeout_ms: u64,
    /// Bounded wait for a blocking command. Generous, since a key may wait for touch.
    pub command_timeout_ms: u64,
    /// Force extended APDUs on or off instead of trusting the key's description.
    pub extended_apdu: Option<bool>,
    /// Start the connection when a key is attached.
    pub auto_start: bool,
    /// Cap on GET RESPONSE rounds per command.
    pub max_get_response_rounds: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 10_000,
            stop_timeout_ms: 5_000,
            command_timeout_ms: 30_000,
            extended_apdu: None,
            auto_start: false,
            max_get_response_rounds: DEFAULT_MAX_GET_RESPONSE_ROUNDS,
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
