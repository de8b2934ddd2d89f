//! Home Assistant MQTT discovery.
//!
//! Fans one [`TankDevice`] out into sensor entities. Each entity gets a
//! retained config message whose unique ID is derived from the serial, so
//! announcing the same device again replaces the entity instead of
//! duplicating it.

use serde::{Deserialize, Serialize};

use otobridge_common::{EntityKind, TopicBuilder, device_id, unique_id};
use otobridge_framework::{BridgeStatus, Publisher, Result, Transport};

use crate::registry::TankDevice;

/// Static settings for discovery payloads.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Topic layout.
    pub topics: TopicBuilder,
    /// Bridge-wide availability topic referenced by every entity.
    pub availability_topic: String,
    /// Seconds after which the hub marks a silent entity unavailable.
    pub expire_after_secs: Option<u64>,
    /// Announce a signal strength entity.
    pub publish_rssi: bool,
    /// Device manufacturer label.
    pub manufacturer: String,
    /// Device model label.
    pub model: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            topics: TopicBuilder::default(),
            availability_topic: "otodata/bridge/status".to_string(),
            expire_after_secs: None,
            publish_rssi: false,
            manufacturer: "Otodata".to_string(),
            model: "TM6030".to_string(),
        }
    }
}

/// Device block grouping a tank's entities in the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

/// Retained config payload for one sensor entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub unit_of_measurement: String,
    pub value_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    pub state_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<u64>,
    pub device: DeviceInfo,
}

struct EntityMeta {
    name: &'static str,
    unit: &'static str,
    device_class: Option<&'static str>,
    icon: Option<&'static str>,
    diagnostic: bool,
}

fn meta(kind: EntityKind) -> EntityMeta {
    match kind {
        EntityKind::Level => EntityMeta {
            name: "Level",
            unit: "%",
            device_class: None,
            icon: Some("mdi:propane-tank"),
            diagnostic: false,
        },
        EntityKind::Battery => EntityMeta {
            name: "Battery",
            unit: "%",
            device_class: Some("battery"),
            icon: None,
            diagnostic: true,
        },
        EntityKind::Temperature => EntityMeta {
            name: "Temperature",
            unit: "°C",
            device_class: Some("temperature"),
            icon: None,
            diagnostic: false,
        },
        EntityKind::Rssi => EntityMeta {
            name: "Signal strength",
            unit: "dBm",
            device_class: Some("signal_strength"),
            icon: None,
            diagnostic: true,
        },
    }
}

/// Publishes discovery, state and availability for tanks.
#[derive(Debug, Clone)]
pub struct DiscoveryPublisher<T> {
    publisher: Publisher<T>,
    settings: DiscoverySettings,
}

impl<T: Transport> DiscoveryPublisher<T> {
    /// Create a discovery publisher.
    pub fn new(publisher: Publisher<T>, settings: DiscoverySettings) -> Self {
        Self {
            publisher,
            settings,
        }
    }

    /// Discovery settings.
    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    /// Entities to announce: what the current reading populates plus
    /// anything announced before.
    pub fn entities(&self, device: &TankDevice) -> Vec<EntityKind> {
        let mut kinds = device.last_reading.entity_kinds(self.settings.publish_rssi);
        kinds.extend(device.announced.iter().copied());
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Build the config payload for one entity.
    pub fn payload(&self, device: &TankDevice, kind: EntityKind) -> DiscoveryPayload {
        let meta = meta(kind);
        let id = unique_id(&device.serial, kind);

        DiscoveryPayload {
            name: meta.name.to_string(),
            object_id: id.clone(),
            unique_id: id,
            state_topic: self.settings.topics.state_topic(&device.serial, kind),
            availability_topic: self.settings.availability_topic.clone(),
            payload_available: BridgeStatus::Online.to_string(),
            payload_not_available: BridgeStatus::Offline.to_string(),
            unit_of_measurement: meta.unit.to_string(),
            value_template: format!("{{{{ value_json.{} }}}}", kind),
            device_class: meta.device_class.map(str::to_string),
            state_class: "measurement".to_string(),
            icon: meta.icon.map(str::to_string),
            entity_category: meta.diagnostic.then(|| "diagnostic".to_string()),
            expire_after: self.settings.expire_after_secs,
            device: DeviceInfo {
                identifiers: vec![device_id(&device.serial)],
                name: format!("Propane Tank {}", device.serial),
                manufacturer: self.settings.manufacturer.clone(),
                model: self.settings.model.clone(),
            },
        }
    }

    /// Publish retained config for every entity of the device.
    ///
    /// Returns the announced kinds. Stops at the first failure so the caller
    /// does not mark the device discovered.
    pub async fn publish_discovery(&self, device: &TankDevice) -> Result<Vec<EntityKind>> {
        let kinds = self.entities(device);
        for kind in &kinds {
            let topic = self.settings.topics.config_topic(&device.serial, *kind);
            self.publisher
                .publish_json(&topic, &self.payload(device, *kind), true)
                .await?;
        }

        tracing::info!(
            serial = %device.serial,
            entities = ?kinds,
            "Published discovery"
        );
        Ok(kinds)
    }

    /// Publish the current values, retained, one topic per entity.
    pub async fn publish_state(&self, device: &TankDevice) -> Result<()> {
        let reading = &device.last_reading;
        for kind in reading.entity_kinds(self.settings.publish_rssi) {
            let Some(value) = reading.value(kind) else {
                continue;
            };
            let topic = self.settings.topics.state_topic(&device.serial, kind);
            let payload = serde_json::json!({ (kind.as_str()): value });
            self.publisher.publish_json(&topic, &payload, true).await?;
        }

        tracing::debug!(
            serial = %device.serial,
            level = reading.level_percent,
            "Published state"
        );
        Ok(())
    }

    /// Publish the bridge-wide status, retained.
    pub async fn publish_availability(&self, status: BridgeStatus) -> Result<()> {
        self.publisher
            .publish_retained(&self.settings.availability_topic, status.as_str())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use otobridge_common::TankReading;
    use otobridge_framework::{MemoryBroker, QoS};
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn device(reading: TankReading) -> TankDevice {
        let mut registry = DeviceRegistry::new(Duration::from_secs(300));
        registry.observe(reading).device().clone()
    }

    fn setup(settings: DiscoverySettings) -> (MemoryBroker, DiscoveryPublisher<MemoryBroker>) {
        let broker = MemoryBroker::new();
        broker.connect(None);
        let publisher = DiscoveryPublisher::new(Publisher::new(broker.clone()), settings);
        (broker, publisher)
    }

    #[test]
    fn test_level_payload() {
        let (_, publisher) = setup(DiscoverySettings::default());
        let tank = device(TankReading::new("A1B2C3", 73));
        let payload = publisher.payload(&tank, EntityKind::Level);

        assert_eq!(payload.unique_id, "otodata_A1B2C3_level");
        assert_eq!(payload.state_topic, "otodata/sensor/A1B2C3/level/state");
        assert_eq!(payload.availability_topic, "otodata/bridge/status");
        assert_eq!(payload.value_template, "{{ value_json.level }}");
        assert_eq!(payload.unit_of_measurement, "%");
        assert_eq!(payload.icon.as_deref(), Some("mdi:propane-tank"));
        assert_eq!(payload.entity_category, None);
        assert_eq!(payload.device.identifiers, vec!["otodata_A1B2C3"]);
        assert_eq!(payload.device.name, "Propane Tank A1B2C3");
    }

    #[test]
    fn test_battery_is_diagnostic() {
        let (_, publisher) = setup(DiscoverySettings::default());
        let tank = device(TankReading::new("A1B2C3", 73).with_battery(91));
        let payload = publisher.payload(&tank, EntityKind::Battery);

        assert_eq!(payload.device_class.as_deref(), Some("battery"));
        assert_eq!(payload.entity_category.as_deref(), Some("diagnostic"));

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("icon").is_none());
        assert!(json.get("expire_after").is_none());
    }

    #[tokio::test]
    async fn test_discovery_only_for_present_fields() {
        let (broker, publisher) = setup(DiscoverySettings::default());
        let tank = device(TankReading::new("A1B2C3", 73).with_rssi(Some(-60)));

        let kinds = assert_ok!(publisher.publish_discovery(&tank).await);
        assert_eq!(kinds, vec![EntityKind::Level]);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "homeassistant/sensor/A1B2C3/level/config");
        assert!(published[0].retain);
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let (broker, publisher) = setup(DiscoverySettings::default());
        let tank = device(TankReading::new("A1B2C3", 73).with_battery(91));

        publisher.publish_discovery(&tank).await.unwrap();
        let first = broker.published();
        broker.clear_log();
        publisher.publish_discovery(&tank).await.unwrap();
        let second = broker.published();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_rssi_entity_when_enabled() {
        let settings = DiscoverySettings {
            publish_rssi: true,
            expire_after_secs: Some(900),
            ..Default::default()
        };
        let (broker, publisher) = setup(settings);
        let tank = device(TankReading::new("A1B2C3", 73).with_rssi(Some(-60)));

        let kinds = assert_ok!(publisher.publish_discovery(&tank).await);
        assert_eq!(kinds, vec![EntityKind::Level, EntityKind::Rssi]);

        let config: serde_json::Value = serde_json::from_str(
            &broker
                .retained_str("homeassistant/sensor/A1B2C3/rssi/config")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(config["unit_of_measurement"], "dBm");
        assert_eq!(config["expire_after"], 900);

        assert_ok!(publisher.publish_state(&tank).await);
        assert_eq!(
            broker
                .retained_str("otodata/sensor/A1B2C3/rssi/state")
                .as_deref(),
            Some(r#"{"rssi":-60}"#)
        );
    }

    #[tokio::test]
    async fn test_state_payloads() {
        let (broker, publisher) = setup(DiscoverySettings::default());
        let tank = device(
            TankReading::new("A1B2C3", 73)
                .with_battery(91)
                .with_temperature(-2.5),
        );

        assert_ok!(publisher.publish_state(&tank).await);

        assert_eq!(
            broker
                .retained_str("otodata/sensor/A1B2C3/level/state")
                .as_deref(),
            Some(r#"{"level":73}"#)
        );
        assert_eq!(
            broker
                .retained_str("otodata/sensor/A1B2C3/battery/state")
                .as_deref(),
            Some(r#"{"battery":91}"#)
        );
        assert_eq!(
            broker
                .retained_str("otodata/sensor/A1B2C3/temperature/state")
                .as_deref(),
            Some(r#"{"temperature":-2.5}"#)
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let (broker, publisher) = setup(DiscoverySettings::default());
        broker.set_failing(true);
        let tank = device(TankReading::new("A1B2C3", 73));

        assert!(publisher.publish_discovery(&tank).await.is_err());
        assert!(publisher.publish_state(&tank).await.is_err());
    }

    #[tokio::test]
    async fn test_availability_is_retained() {
        let (broker, publisher) = setup(DiscoverySettings::default());

        publisher
            .publish_availability(BridgeStatus::Online)
            .await
            .unwrap();

        assert_eq!(
            broker.retained_str("otodata/bridge/status").as_deref(),
            Some("online")
        );
    }
}
