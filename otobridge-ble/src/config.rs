//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use otobridge_common::{BackoffConfig, TopicBuilder, validate_publish_topic};
use otobridge_framework::{BridgeConfig, BridgeError, LoggingConfig, MqttConfig, Result};

use crate::discovery::DiscoverySettings;
use crate::parser::{DEFAULT_NAME_PREFIX, GrammarKind};

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtobridgeConfig {
    /// MQTT broker connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Topic layout and publishing behaviour.
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// BLE scanning and decoding.
    #[serde(default)]
    pub ble: BleConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Topic layout and publishing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Retained `online`/`offline` topic, also the will topic.
    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    /// Retained diagnostics document.
    #[serde(default = "default_info_topic")]
    pub info_topic: String,

    /// Home Assistant discovery prefix.
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Prefix for state topics.
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,

    /// Republish unchanged state after this many seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Let the hub expire silent entities after this many seconds.
    #[serde(default)]
    pub expire_after_secs: Option<u64>,

    /// Announce a signal strength entity per tank.
    #[serde(default)]
    pub publish_rssi: bool,

    /// Capacity of the advertisement channel, at most [`MAX_CHANNEL_CAPACITY`].
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Upper bound for each shutdown step in milliseconds.
    #[serde(default = "default_shutdown_step_timeout_ms")]
    pub shutdown_step_timeout_ms: u64,

    /// Only publish these serials (empty means all).
    #[serde(default)]
    pub serial_allowlist: Vec<String>,

    /// Device manufacturer label.
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    /// Device model label.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_status_topic() -> String {
    "otodata/bridge/status".to_string()
}

fn default_info_topic() -> String {
    "otodata/bridge/info".to_string()
}

fn default_discovery_prefix() -> String {
    otobridge_common::topics::DISCOVERY_PREFIX.to_string()
}

fn default_state_prefix() -> String {
    otobridge_common::topics::STATE_PREFIX.to_string()
}

/// Largest accepted `bridge.channel_capacity`.
pub const MAX_CHANNEL_CAPACITY: usize = 65_536;

fn default_heartbeat_secs() -> u64 {
    300
}

fn default_channel_capacity() -> usize {
    256
}

fn default_shutdown_step_timeout_ms() -> u64 {
    5000
}

fn default_manufacturer() -> String {
    "Otodata".to_string()
}

fn default_model() -> String {
    "TM6030".to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            status_topic: default_status_topic(),
            info_topic: default_info_topic(),
            discovery_prefix: default_discovery_prefix(),
            state_prefix: default_state_prefix(),
            heartbeat_secs: default_heartbeat_secs(),
            expire_after_secs: None,
            publish_rssi: false,
            channel_capacity: default_channel_capacity(),
            shutdown_step_timeout_ms: default_shutdown_step_timeout_ms(),
            serial_allowlist: Vec::new(),
            manufacturer: default_manufacturer(),
            model: default_model(),
        }
    }
}

impl BridgeSettings {
    /// Heartbeat interval.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Whether readings for `serial` should be published.
    pub fn allows(&self, serial: &str) -> bool {
        self.serial_allowlist.is_empty() || self.serial_allowlist.iter().any(|s| s == serial)
    }

    /// Topic layout.
    pub fn topics(&self) -> TopicBuilder {
        TopicBuilder::new(&self.discovery_prefix, &self.state_prefix)
    }

    /// Settings for discovery payloads.
    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            topics: self.topics(),
            availability_topic: self.status_topic.clone(),
            expire_after_secs: self.expire_after_secs,
            publish_rssi: self.publish_rssi,
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
        }
    }
}

/// BLE scanning and decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    /// Adapter to use, matched against the adapter description.
    /// First adapter when unset.
    #[serde(default)]
    pub adapter: Option<String>,

    /// Advertisement grammar.
    #[serde(default)]
    pub grammar: GrammarKind,

    /// Friendly-name prefix for the `name-tokens` grammar.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Restart the scan after this many seconds without any event.
    #[serde(default = "default_idle_restart_secs")]
    pub idle_restart_secs: u64,

    /// Backoff between scan restarts.
    #[serde(default)]
    pub rescan: BackoffConfig,
}

fn default_name_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}

fn default_idle_restart_secs() -> u64 {
    120
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            grammar: GrammarKind::default(),
            name_prefix: default_name_prefix(),
            idle_restart_secs: default_idle_restart_secs(),
            rescan: BackoffConfig::default(),
        }
    }
}

impl BleConfig {
    /// Idle timeout before restarting the scan.
    pub fn idle_restart(&self) -> Duration {
        Duration::from_secs(self.idle_restart_secs)
    }
}

impl OtobridgeConfig {
    /// Apply environment overrides using the given lookup function.
    ///
    /// `MQTT_BROKER`, `MQTT_PORT`, `MQTT_USER`, `MQTT_PASS` and `BRIDGE_TOPIC`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.mqtt.apply_env_with(&lookup)?;
        if let Some(topic) = lookup("BRIDGE_TOPIC") {
            self.bridge.status_topic = topic;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate_config(&self) -> Result<()> {
        self.mqtt.validate()?;
        self.ble.rescan.validate("ble.rescan")?;

        let bridge = &self.bridge;
        validate_publish_topic(&bridge.status_topic)
            .map_err(|e| BridgeError::validation(format!("bridge.status_topic: {}", e)))?;
        validate_publish_topic(&bridge.info_topic)
            .map_err(|e| BridgeError::validation(format!("bridge.info_topic: {}", e)))?;

        for (name, prefix) in [
            ("bridge.discovery_prefix", &bridge.discovery_prefix),
            ("bridge.state_prefix", &bridge.state_prefix),
        ] {
            validate_publish_topic(prefix)
                .map_err(|e| BridgeError::validation(format!("{}: {}", name, e)))?;
        }

        if bridge.heartbeat_secs == 0 {
            return Err(BridgeError::validation(
                "bridge.heartbeat_secs must be greater than 0",
            ));
        }
        if let Some(expire) = bridge
            .expire_after_secs
            .filter(|expire| *expire <= bridge.heartbeat_secs)
        {
            return Err(BridgeError::validation(format!(
                "bridge.expire_after_secs ({}) must be greater than bridge.heartbeat_secs ({})",
                expire, bridge.heartbeat_secs
            )));
        }
        if bridge.channel_capacity == 0 || bridge.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(BridgeError::validation(format!(
                "bridge.channel_capacity must be between 1 and {}",
                MAX_CHANNEL_CAPACITY
            )));
        }
        if self.ble.name_prefix.is_empty() && self.ble.grammar == GrammarKind::NameTokens {
            return Err(BridgeError::validation(
                "ble.name_prefix must not be empty for the name-tokens grammar",
            ));
        }
        if self.ble.idle_restart_secs == 0 {
            return Err(BridgeError::validation(
                "ble.idle_restart_secs must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl BridgeConfig for OtobridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn status_topic(&self) -> &str {
        &self.bridge.status_topic
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![self.bridge.topics().birth_topic()]
    }

    fn shutdown_step_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.shutdown_step_timeout_ms)
    }

    fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
