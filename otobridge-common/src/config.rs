use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password (only used together with `username`).
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Capacity of the outgoing request queue.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    /// How long a publish may wait for room in the request queue.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Reconnect backoff.
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "otodata".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_request_capacity() -> usize {
    64
}

fn default_publish_timeout_ms() -> u64 {
    2000
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            request_capacity: default_request_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Keep-alive interval.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Publish queueing timeout.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Apply `MQTT_BROKER`, `MQTT_PORT`, `MQTT_USER` and `MQTT_PASS` using the
    /// given lookup function.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_BROKER") {
            self.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("Invalid MQTT_PORT: '{}'", port)))?;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.username = Some(user);
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.password = Some(pass);
        }
        Ok(())
    }

    /// Validate connection settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("mqtt.port must not be 0".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("mqtt.client_id must not be empty".to_string()));
        }
        if self.request_capacity == 0 {
            return Err(Error::Config(
                "mqtt.request_capacity must be at least 1".to_string(),
            ));
        }
        if self.keep_alive_secs < 5 {
            return Err(Error::Config(
                "mqtt.keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Config(
                "mqtt.password requires mqtt.username".to_string(),
            ));
        }
        self.reconnect.validate("mqtt.reconnect")
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay in milliseconds.
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    /// Upper bound for the delay in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    /// Factor applied after each failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffConfig {
    /// Validate the settings. `section` names the config section in errors.
    pub fn validate(&self, section: &str) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(Error::Config(format!(
                "{}.initial_ms must be greater than 0",
                section
            )));
        }
        if self.initial_ms > self.max_ms {
            return Err(Error::Config(format!(
                "{}.initial_ms ({}) exceeds max_ms ({})",
                section, self.initial_ms, self.max_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "{}.multiplier must be >= 1.0",
                section
            )));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_parse_mqtt_config() {
        let json5 = r#"
        {
            mqtt: {
                host: "broker.lan",
                port: 8883,
                username: "bridge",
                password: "secret",
                reconnect: { initial_ms: 500, max_ms: 10000 },
            },
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: TestConfig = parse_config(json5).unwrap();

        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
        assert_eq!(config.mqtt.reconnect.initial_ms, 500);
        assert_eq!(config.mqtt.reconnect.multiplier, 2.0);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_default_config() {
        let config: TestConfig = parse_config("{}").unwrap();

        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.client_id, "otodata");
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.mqtt.validate().is_ok());
    }

    #[test]
    fn test_json_logging_format() {
        let json5 = r#"{ logging: { level: "debug", format: "json" } }"#;
        let config: TestConfig = parse_config(json5).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MQTT_BROKER", "10.0.0.5"),
            ("MQTT_PORT", "1884"),
            ("MQTT_USER", "ha"),
            ("MQTT_PASS", "pw"),
        ]
        .into_iter()
        .collect();

        let mut config = MqttConfig::default();
        config
            .apply_env_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 1884);
        assert_eq!(config.username.as_deref(), Some("ha"));
        assert_eq!(config.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_env_invalid_port() {
        let mut config = MqttConfig::default();
        let result = config.apply_env_with(|key| (key == "MQTT_PORT").then(|| "abc".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(config.port, 1883);
    }

    #[test]
    fn test_validate_rejects_password_without_user() {
        let config = MqttConfig {
            password: Some("pw".to_string()),
            ..MqttConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_validation() {
        let backoff = BackoffConfig {
            initial_ms: 5000,
            max_ms: 1000,
            multiplier: 2.0,
        };
        assert!(backoff.validate("ble.rescan").is_err());

        let backoff = BackoffConfig {
            multiplier: 0.5,
            ..BackoffConfig::default()
        };
        assert!(backoff.validate("ble.rescan").is_err());
    }
}
