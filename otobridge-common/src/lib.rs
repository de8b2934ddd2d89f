//! Otobridge Common Library
//!
//! This crate provides shared types and utilities for the Otodata BLE to MQTT bridge:
//!
//! - [`reading`] - Advertisement and tank reading data model (`RawAdvertisement`, `TankReading`, `EntityKind`)
//! - [`topics`] - MQTT topic and unique ID builders
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`backoff`] - Capped exponential backoff for reconnect loops
//! - [`error`] - Error types

pub mod backoff;
pub mod config;
pub mod error;
pub mod reading;
pub mod topics;

// Re-export commonly used types at the crate root
pub use backoff::Backoff;
pub use config::{BackoffConfig, LogFormat, LoggingConfig, MqttConfig, parse_config};
pub use error::{Error, Result};
pub use reading::{EntityKind, RawAdvertisement, TankReading};
pub use topics::{TopicBuilder, device_id, unique_id, validate_publish_topic};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
