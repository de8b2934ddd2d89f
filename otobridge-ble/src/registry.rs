//! Per-device registry.
//!
//! Keyed by the serial decoded from the advertisement, never by hardware
//! address: addresses may rotate, the serial does not. Entries live for the
//! lifetime of the process.
//!
//! The registry only decides; it never publishes. The bridge is its single
//! writer and reports back with [`DeviceRegistry::mark_discovered`] and
//! [`DeviceRegistry::mark_published`] once the corresponding messages were
//! accepted by the transport.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use otobridge_common::{EntityKind, TankReading};

/// Registry shared between the bridge (writer) and diagnostics (readers).
pub type SharedRegistry = Arc<RwLock<DeviceRegistry>>;

/// One physical tank monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TankDevice {
    /// Stable identity.
    pub serial: String,
    /// Most recent valid reading.
    pub last_reading: TankReading,
    /// When the device was first seen.
    pub first_seen_at: DateTime<Utc>,
    /// When the device was last seen.
    pub last_seen_at: DateTime<Utc>,
    /// Whether discovery has been published for this device.
    pub discovered: bool,
    /// Entities announced so far.
    pub announced: BTreeSet<EntityKind>,
    /// State values changed since the last successful state publish.
    pub state_pending: bool,
    /// Last successful state publish.
    pub last_published_at: Option<DateTime<Utc>>,
    /// Hardware address of the latest sighting.
    pub last_address: Option<String>,
    /// Signal strength of the latest sighting.
    pub last_rssi: Option<i16>,
    /// Number of valid sightings.
    pub sightings: u64,
}

impl TankDevice {
    fn new(reading: TankReading, now: DateTime<Utc>) -> Self {
        Self {
            serial: reading.serial.clone(),
            last_rssi: reading.rssi,
            last_reading: reading,
            first_seen_at: now,
            last_seen_at: now,
            discovered: false,
            announced: BTreeSet::new(),
            state_pending: true,
            last_published_at: None,
            last_address: None,
            sightings: 1,
        }
    }

    /// Entities the current reading populates that were never announced.
    pub fn unannounced(&self, include_rssi: bool) -> Vec<EntityKind> {
        self.last_reading
            .entity_kinds(include_rssi)
            .into_iter()
            .filter(|kind| !self.announced.contains(kind))
            .collect()
    }
}

/// Outcome of [`DeviceRegistry::observe`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationResult {
    /// First valid reading for this serial. Not yet discovered.
    NewDevice(TankDevice),
    /// Known serial; `changed` is false for a heartbeat refresh.
    Updated { device: TankDevice, changed: bool },
    /// Known serial, same values, heartbeat not due.
    Unchanged(TankDevice),
}

impl ObservationResult {
    /// Device snapshot after the observation.
    pub fn device(&self) -> &TankDevice {
        match self {
            ObservationResult::NewDevice(device)
            | ObservationResult::Updated { device, .. }
            | ObservationResult::Unchanged(device) => device,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ObservationResult::NewDevice(_) => "new",
            ObservationResult::Updated { changed: true, .. } => "changed",
            ObservationResult::Updated { changed: false, .. } => "heartbeat",
            ObservationResult::Unchanged(_) => "unchanged",
        }
    }
}

/// In-memory table of known tanks.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, TankDevice>,
    heartbeat: Duration,
}

impl DeviceRegistry {
    /// Create an empty registry with the given heartbeat interval.
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            devices: BTreeMap::new(),
            heartbeat,
        }
    }

    /// Wrap in the shared handle.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Heartbeat interval.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Record a reading seen now.
    pub fn observe(&mut self, reading: TankReading) -> ObservationResult {
        self.observe_at(reading, Utc::now())
    }

    /// Record a reading seen at `now`.
    pub fn observe_at(&mut self, reading: TankReading, now: DateTime<Utc>) -> ObservationResult {
        let heartbeat = self.heartbeat;

        let Some(device) = self.devices.get_mut(&reading.serial) else {
            let device = TankDevice::new(reading, now);
            tracing::info!(serial = %device.serial, "New tank");
            self.devices.insert(device.serial.clone(), device.clone());
            return ObservationResult::NewDevice(device);
        };

        let changed = !device.last_reading.same_values(&reading);
        device.last_seen_at = now;
        device.last_rssi = reading.rssi;
        device.sightings += 1;
        device.last_reading = reading;

        if changed {
            device.state_pending = true;
            return ObservationResult::Updated {
                device: device.clone(),
                changed: true,
            };
        }

        let reference = device.last_published_at.unwrap_or(device.first_seen_at);
        let heartbeat_due = (now - reference)
            .to_std()
            .map(|elapsed| elapsed >= heartbeat)
            .unwrap_or(false);

        if heartbeat_due {
            ObservationResult::Updated {
                device: device.clone(),
                changed: false,
            }
        } else {
            ObservationResult::Unchanged(device.clone())
        }
    }

    /// Remember the hardware address a device was last heard from.
    pub fn set_address(&mut self, serial: &str, address: impl Into<String>) {
        if let Some(device) = self.devices.get_mut(serial) {
            device.last_address = Some(address.into());
        }
    }

    /// Discovery for `kinds` was accepted by the transport.
    ///
    /// Returns false if the serial is unknown.
    pub fn mark_discovered(&mut self, serial: &str, kinds: &[EntityKind]) -> bool {
        match self.devices.get_mut(serial) {
            Some(device) => {
                device.discovered = true;
                device.announced.extend(kinds.iter().copied());
                true
            }
            None => false,
        }
    }

    /// State was accepted by the transport at `at`.
    ///
    /// Returns false if the serial is unknown.
    pub fn mark_published(&mut self, serial: &str, at: DateTime<Utc>) -> bool {
        match self.devices.get_mut(serial) {
            Some(device) => {
                device.last_published_at = Some(at);
                device.state_pending = false;
                true
            }
            None => false,
        }
    }

    /// Look up a device.
    pub fn get(&self, serial: &str) -> Option<&TankDevice> {
        self.devices.get(serial)
    }

    /// All devices, ordered by serial.
    pub fn devices(&self) -> impl Iterator<Item = &TankDevice> {
        self.devices.values()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Compact per-device summary for the bridge info document.
    pub fn summary(&self) -> serde_json::Value {
        self.devices()
            .map(|d| {
                serde_json::json!({
                    "serial": d.serial,
                    "level": d.last_reading.level_percent,
                    "battery": d.last_reading.battery_percent,
                    "temperature": d.last_reading.temperature,
                    "rssi": d.last_rssi,
                    "address": d.last_address,
                    "last_seen": d.last_seen_at,
                    "sightings": d.sightings,
                    "discovered": d.discovered,
                })
            })
            .collect()
    }
}
