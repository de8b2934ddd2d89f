//! Configuration traits and utilities.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, MqttConfig};

/// Trait for bridge configuration types.
///
/// Implement this trait for the bridge's configuration struct to get
/// loading, environment overrides, validation, and access to the fields the
/// framework needs to open the MQTT session.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use otobridge_framework::{BridgeConfig, LoggingConfig, MqttConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub mqtt: MqttConfig,
///     pub logging: LoggingConfig,
///     pub status_topic: String,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn mqtt(&self) -> &MqttConfig {
///         &self.mqtt
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn status_topic(&self) -> &str {
///         &self.status_topic
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the MQTT connection configuration.
    fn mqtt(&self) -> &MqttConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Topic carrying the bridge-wide `online`/`offline` status.
    fn status_topic(&self) -> &str;

    /// Topics to (re)subscribe on every connection.
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Upper bound for each shutdown step.
    fn shutdown_step_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Apply overrides from the process environment.
    ///
    /// Called by [`load`](Self::load) before validation.
    fn apply_env(&mut self) -> Result<()> {
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Applies environment overrides, then calls
    /// [`validate`](Self::validate).
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::with_context(format!("Failed to read {}", path.display()), e)
        })?;
        let mut config: Self = json5::from_str(&content)?;

        config.apply_env()?;
        config.validate()?;

        Ok(config)
    }
}
