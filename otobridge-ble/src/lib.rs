//! MQTT bridge for Otodata propane tank monitors.
//!
//! Passively scans for BLE advertisements from tank monitors, decodes
//! serial, fill level, battery and temperature, and exposes every tank to
//! Home Assistant through MQTT discovery.
//!
//! # Topic Layout
//!
//! ```text
//! homeassistant/sensor/{serial}/{entity}/config   retained discovery config
//! otodata/sensor/{serial}/{entity}/state          retained {"<entity>": value}
//! otodata/bridge/status                           retained online/offline (will)
//! otodata/bridge/info                             retained diagnostics
//! ```
//!
//! For example, a tank advertising `OTO sn:A1B2C3 lvl:73 bat:91` yields
//! `otodata/sensor/A1B2C3/level/state` = `{"level":73}`.

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod parser;
pub mod registry;
pub mod scanner;

pub use bridge::{Bridge, BridgeStats, Outcome};
pub use config::{BleConfig, BridgeSettings, MAX_CHANNEL_CAPACITY, OtobridgeConfig};
pub use discovery::{DiscoveryPayload, DiscoveryPublisher, DiscoverySettings};
pub use parser::{AdvertisementGrammar, GrammarKind, NameTokenGrammar, OtodataGrammar, ParseError};
pub use registry::{DeviceRegistry, ObservationResult, SharedRegistry, TankDevice};
pub use scanner::{ScanError, Scanner};
