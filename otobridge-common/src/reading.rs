use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single BLE advertisement sighting as delivered by the scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Hardware address of the sender. May rotate; never used as identity.
    pub address: String,

    /// Received signal strength in dBm.
    pub rssi: Option<i16>,

    /// Advertised friendly name.
    pub local_name: Option<String>,

    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl RawAdvertisement {
    /// Create an advertisement from a hardware address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the advertised friendly name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Set the received signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Add manufacturer data for a company identifier.
    pub fn with_manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data.insert(company_id, data.into());
        self
    }
}

/// A decoded tank reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankReading {
    /// Stable device identity decoded from the advertisement content.
    pub serial: String,

    /// Tank fill level, 0-100.
    pub level_percent: u8,

    /// Sensor battery, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,

    /// Temperature in degrees Celsius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Signal strength of the sighting. Diagnostic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,

    /// Original advertised text.
    #[serde(default)]
    pub raw_name: String,
}

impl TankReading {
    /// Create a reading with only the required fields.
    pub fn new(serial: impl Into<String>, level_percent: u8) -> Self {
        Self {
            serial: serial.into(),
            level_percent,
            battery_percent: None,
            temperature: None,
            rssi: None,
            raw_name: String::new(),
        }
    }

    /// Set the battery level.
    pub fn with_battery(mut self, battery_percent: u8) -> Self {
        self.battery_percent = Some(battery_percent);
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the sighting's signal strength.
    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    /// Set the original advertised text.
    pub fn with_raw_name(mut self, raw_name: impl Into<String>) -> Self {
        self.raw_name = raw_name.into();
        self
    }

    /// Compare the published quantities only.
    ///
    /// Raw text and signal strength are ignored, so two differently encoded
    /// advertisements carrying the same values compare equal.
    pub fn same_values(&self, other: &TankReading) -> bool {
        self.level_percent == other.level_percent
            && self.battery_percent == other.battery_percent
            && self.temperature == other.temperature
    }

    /// Value of one entity, if this reading carries it.
    pub fn value(&self, kind: EntityKind) -> Option<serde_json::Value> {
        match kind {
            EntityKind::Level => Some(self.level_percent.into()),
            EntityKind::Battery => self.battery_percent.map(Into::into),
            EntityKind::Temperature => self.temperature.map(Into::into),
            EntityKind::Rssi => self.rssi.map(Into::into),
        }
    }

    /// Entities this reading can populate.
    pub fn entity_kinds(&self, include_rssi: bool) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| include_rssi || *kind != EntityKind::Rssi)
            .filter(|kind| self.value(*kind).is_some())
            .collect()
    }
}

/// Hub-visible sensor entity derived from a tank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Level,
    Battery,
    Temperature,
    Rssi,
}

impl EntityKind {
    /// All entity kinds in publishing order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Level,
        EntityKind::Battery,
        EntityKind::Temperature,
        EntityKind::Rssi,
    ];

    /// Topic segment and JSON key for this entity.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Level => "level",
            EntityKind::Battery => "battery",
            EntityKind::Temperature => "temperature",
            EntityKind::Rssi => "rssi",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_values_ignores_diagnostics() {
        let a = TankReading::new("A1B2C3", 73)
            .with_battery(91)
            .with_rssi(Some(-70))
            .with_raw_name("OTO sn:A1B2C3 lvl:73 bat:91");
        let b = TankReading::new("A1B2C3", 73)
            .with_battery(91)
            .with_rssi(Some(-81))
            .with_raw_name("OTO serial=A1B2C3;level=73.0;battery=91");

        assert!(a.same_values(&b));
        assert!(!a.same_values(&b.clone().with_battery(90)));
    }

    #[test]
    fn test_entity_kinds() {
        let reading = TankReading::new("A1B2C3", 73)
            .with_battery(91)
            .with_rssi(Some(-70));

        assert_eq!(
            reading.entity_kinds(false),
            vec![EntityKind::Level, EntityKind::Battery]
        );
        assert_eq!(
            reading.entity_kinds(true),
            vec![EntityKind::Level, EntityKind::Battery, EntityKind::Rssi]
        );
    }

    #[test]
    fn test_values_serialize_as_numbers() {
        let reading = TankReading::new("A1B2C3", 73).with_temperature(21.5);

        assert_eq!(reading.value(EntityKind::Level), Some(serde_json::json!(73)));
        assert_eq!(
            reading.value(EntityKind::Temperature),
            Some(serde_json::json!(21.5))
        );
        assert_eq!(reading.value(EntityKind::Battery), None);
    }

    #[test]
    fn test_entity_kind_serialization() {
        let json = serde_json::to_string(&EntityKind::Temperature).unwrap();
        assert_eq!(json, "\"temperature\"");
        assert_eq!(EntityKind::Rssi.to_string(), "rssi");
    }
}
