//! Configuration types for the device engine
//!
//! This is the local configuration a device is started with (identity,
//! initial endpoint, tunables). It is distinct from the protocol `Config`
//! document the controller pushes at runtime.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::model::EndpointConfiguration;

/// Main device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier used to scope topics
    pub device_id: String,

    /// Initial transport endpoint (a persisted endpoint takes precedence)
    pub endpoint: EndpointConfiguration,

    /// Hardware/software identity reported in state
    #[serde(default)]
    pub identity: DeviceIdentity,

    /// Gateway metadata; present when this device relays for proxies
    #[serde(default)]
    pub gateway: Option<GatewayMetadata>,

    /// Device points and their initial present values
    #[serde(default)]
    pub points: BTreeMap<String, serde_json::Value>,

    /// Local network address per family
    #[serde(default)]
    pub localnet: BTreeMap<String, String>,

    /// Behavior switches
    #[serde(default)]
    pub options: DeviceOptions,

    /// Where persistent data lives
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Where inbound/outbound documents are mirrored
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Engine tunables
    #[serde(default)]
    pub engine: EngineConfig,
}

impl DeviceConfig {
    /// Create a configuration with defaults
    pub fn new(device_id: impl Into<String>, endpoint: EndpointConfiguration) -> Self {
        Self {
            device_id: device_id.into(),
            endpoint,
            identity: DeviceIdentity::default(),
            gateway: None,
            points: BTreeMap::new(),
            localnet: BTreeMap::new(),
            options: DeviceOptions::default(),
            persistence: PersistenceConfig::default(),
            recording: RecordingConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Declare this device a gateway for the given proxies
    pub fn with_proxies<I, S>(mut self, proxy_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gateway = Some(GatewayMetadata {
            proxy_ids: proxy_ids.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Add a point with its initial present value
    pub fn with_point(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.points.insert(name.into(), value);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_device_id(&self.device_id)?;
        self.endpoint.validate()?;
        self.engine.validate()?;

        if let Some(gateway) = &self.gateway {
            let mut seen = HashSet::new();
            for proxy_id in &gateway.proxy_ids {
                validate_device_id(proxy_id)?;
                if proxy_id == &self.device_id {
                    return Err(crate::Error::config(format!(
                        "Gateway {} cannot proxy itself",
                        self.device_id
                    )));
                }
                if !seen.insert(proxy_id.as_str()) {
                    return Err(crate::Error::config(format!(
                        "Duplicate proxy id: {}",
                        proxy_id
                    )));
                }
            }
        }

        if let Some(level) = self.options.fixed_log_level {
            if level == 0 || level > 900 {
                return Err(crate::Error::config(format!(
                    "Fixed log level must be between 1 and 900. Got: {}",
                    level
                )));
            }
        }

        Ok(())
    }

    /// Derive the configuration of a proxy device relayed by this gateway
    pub fn for_proxy(&self, proxy_id: &str) -> Self {
        Self {
            device_id: proxy_id.to_string(),
            endpoint: self.endpoint.clone(),
            identity: DeviceIdentity::default(),
            gateway: None,
            points: self.points.clone(),
            localnet: BTreeMap::new(),
            options: DeviceOptions {
                fixed_log_level: self.options.fixed_log_level,
                ..DeviceOptions::default()
            },
            persistence: PersistenceConfig::Memory,
            recording: self.recording.clone(),
            engine: self.engine.clone(),
        }
    }
}

fn validate_device_id(device_id: &str) -> Result<(), crate::Error> {
    if device_id.is_empty() {
        return Err(crate::Error::config("Device id cannot be empty"));
    }
    if device_id.contains('/') || device_id.chars().any(char::is_whitespace) {
        return Err(crate::Error::config(format!(
            "Device id contains invalid characters: '{}'",
            device_id
        )));
    }
    Ok(())
}

/// Identity reported in `state.system`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial_no: Option<String>,
    #[serde(default)]
    pub software: BTreeMap<String, String>,
}

/// Gateway metadata; proxy membership is driven only by this
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayMetadata {
    pub proxy_ids: Vec<String>,
}

/// Behavior switches, mostly used for test coverage of failure paths
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceOptions {
    /// Skip the lexicographically-first proxy (simulates an unreachable device)
    #[serde(default)]
    pub no_proxy: bool,

    /// Add a fixed synthetic proxy device
    #[serde(default)]
    pub extra_device: bool,

    /// Shut down cleanly when restarted with the expected `last_start`
    #[serde(default)]
    pub smoke_check: bool,

    /// Log level override taking precedence over `system.min_loglevel`
    #[serde(default)]
    pub fixed_log_level: Option<u16>,

    /// Redirect to this registry instead of using endpoint blobs
    #[serde(default)]
    pub redirect_registry: Option<String>,
}

/// Persistent store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistenceConfig {
    /// File-based store
    File {
        /// Path to the persistent data file
        path: String,
    },

    /// In-memory store (not persistent)
    #[default]
    Memory,
}

/// Message recording configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordingConfig {
    /// Do not mirror documents
    #[default]
    Disabled,

    /// Mirror documents to JSON-lines files in a directory
    File {
        /// Output directory
        dir: String,
    },
}

/// Engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum interval between two state publications (milliseconds)
    ///
    /// Updates requested inside the interval coalesce into one publication
    /// carrying the latest state. Set to 0 to disable throttling.
    #[serde(default = "default_state_throttle_ms")]
    pub state_throttle_ms: u64,

    /// How long a synchronous publish waits for the transport
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    /// How long a discovery scan may run
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,

    /// Telemetry cadence when the config does not set one
    #[serde(default = "default_sample_rate_secs")]
    pub sample_rate_secs: u64,

    /// Optional bounded wait for the first config at startup
    #[serde(default)]
    pub config_wait_secs: Option<u64>,

    /// Capacity of the engine event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Number of recent entries kept in the in-memory local log
    #[serde(default = "default_local_log_capacity")]
    pub local_log_capacity: usize,
}

impl EngineConfig {
    pub fn state_throttle(&self) -> Duration {
        Duration::from_millis(self.state_throttle_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn sample_rate(&self) -> Duration {
        Duration::from_secs(self.sample_rate_secs)
    }

    /// Validate the engine tunables
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.publish_timeout_secs == 0 {
            return Err(crate::Error::config("Publish timeout must be > 0"));
        }
        if self.scan_duration_secs == 0 {
            return Err(crate::Error::config("Scan duration must be > 0"));
        }
        if self.sample_rate_secs == 0 {
            return Err(crate::Error::config("Sample rate must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_throttle_ms: default_state_throttle_ms(),
            publish_timeout_secs: default_publish_timeout_secs(),
            scan_duration_secs: default_scan_duration_secs(),
            sample_rate_secs: default_sample_rate_secs(),
            config_wait_secs: None,
            event_channel_capacity: default_event_channel_capacity(),
            local_log_capacity: default_local_log_capacity(),
        }
    }
}

fn default_state_throttle_ms() -> u64 {
    2000
}

fn default_publish_timeout_secs() -> u64 {
    10
}

fn default_scan_duration_secs() -> u64 {
    10
}

fn default_sample_rate_secs() -> u64 {
    10
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_local_log_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> EndpointConfiguration {
        EndpointConfiguration::new("memory", "broker")
    }

    #[test]
    fn test_defaults_validate() {
        let config = DeviceConfig::new("AHU-1", endpoint());
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.state_throttle(), Duration::from_millis(2000));
    }

    #[test]
    fn test_rejects_bad_proxy_ids() {
        let config = DeviceConfig::new("GAT-1", endpoint()).with_proxies(["AHU-1", "AHU-1"]);
        assert!(config.validate().is_err());

        let config = DeviceConfig::new("GAT-1", endpoint()).with_proxies(["GAT-1"]);
        assert!(config.validate().is_err());

        let config = DeviceConfig::new("GAT-1", endpoint()).with_proxies(["bad/id"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_config_inherits_engine() {
        let mut config = DeviceConfig::new("GAT-1", endpoint()).with_point("temp", 21.into());
        config.engine.state_throttle_ms = 0;
        config.options.smoke_check = true;
        let proxy = config.for_proxy("AHU-1");
        assert_eq!(proxy.device_id, "AHU-1");
        assert_eq!(proxy.engine.state_throttle_ms, 0);
        assert!(!proxy.options.smoke_check);
        assert!(proxy.gateway.is_none());
        assert!(proxy.points.contains_key("temp"));
    }
}
