//! Otobridge Bridge Framework
//!
//! Plumbing shared by the bridge binary: configuration loading, the MQTT
//! session, bridge availability, and publishing.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading, env overrides and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, ordered shutdown)
//! - [`MqttSession`] driving the `rumqttc` event loop and reporting [`SessionEvent`]s
//! - [`AvailabilityMonitor`] owning the Last-Will-and-Testament and online/offline state
//! - [`Publisher`] over any [`Transport`], with [`MemoryBroker`] for tests
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeInfo`] for the retained diagnostics document
//!
//! # Example
//!
//! ```ignore
//! use otobridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner, wait_for_signal};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
//!     let events = runner.take_events();
//!
//!     wait_for_signal().await;
//!     runner.shutdown().await;
//!     Ok(())
//! }
//! ```

mod args;
mod availability;
mod config;
mod error;
mod memory;
mod publisher;
mod runner;
mod session;
mod shutdown;
mod status;

pub use args::BridgeArgs;
pub use availability::{AvailabilityMonitor, AvailabilityState, BridgeStatus, Will};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use memory::{MemoryBroker, Published};
pub use publisher::{Publisher, Transport};
pub use runner::BridgeRunner;
pub use session::{MqttSession, MqttTransport, SessionEvent, mqtt_options};
pub use shutdown::{run_step, wait_for_signal};
pub use status::BridgeInfo;

// Re-export commonly used types
pub use otobridge_common::{BackoffConfig, LogFormat, LoggingConfig, MqttConfig};
pub use rumqttc::QoS;
