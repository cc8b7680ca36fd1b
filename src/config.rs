//! Agent configuration
//!
//! Loaded from a JSON file; every field has a default so a file only needs to
//! name what it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{GeoPoint, ProcProbe, SamplingConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Coordinator reconnection backoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub fast_delay_ms: u64,
    pub slow_delay_ms: u64,
    /// Attempts made at the fast delay before falling back to the slow one.
    pub fast_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            fast_delay_ms: 2_000,
            slow_delay_ms: 60_000,
            fast_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt < self.fast_attempts {
            Duration::from_millis(self.fast_delay_ms)
        } else {
            Duration::from_millis(self.slow_delay_ms)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub device_name: String,
    pub location: Option<GeoPoint>,
    pub coordinator_url: String,
    /// Bus endpoint; derived from the coordinator URL when unset.
    pub broker_endpoint: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub network_interval_ms: u64,
    /// Silence after which the coordinator is declared inactive.
    pub inactive_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    /// Interface whose counters feed rx/tx load; first non-loopback when unset.
    pub network_interface: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_name: "dnr-device".to_string(),
            location: None,
            coordinator_url: "ws://localhost:1818".to_string(),
            broker_endpoint: None,
            heartbeat_interval_ms: 5_000,
            snapshot_interval_ms: 5_000,
            network_interval_ms: 2_000,
            inactive_timeout_ms: 45_000,
            reconnect: ReconnectPolicy::default(),
            network_interface: None,
        }
    }
}

impl AgentConfig {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.trim().is_empty() {
            return Err(ConfigError::Invalid("deviceName must not be empty".to_string()));
        }
        if self.coordinator_url.trim().is_empty() {
            return Err(ConfigError::Invalid("coordinatorUrl must not be empty".to_string()));
        }
        let intervals = [
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("snapshotIntervalMs", self.snapshot_interval_ms),
            ("networkIntervalMs", self.network_interval_ms),
            ("inactiveTimeoutMs", self.inactive_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// The bus endpoint, defaulting to `<coordinatorUrl>/mqttws`.
    pub fn broker_endpoint(&self) -> String {
        match &self.broker_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("{}/mqttws", self.coordinator_url.trim_end_matches('/')),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_timeout_ms)
    }

    /// A `/proc` probe reading the configured interface.
    pub fn proc_probe(&self) -> ProcProbe {
        ProcProbe::new(self.network_interface.clone())
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            snapshot_interval: Duration::from_millis(self.snapshot_interval_ms),
            network_interval: Duration::from_millis(self.network_interval_ms),
        }
    }
}
