//! Pipeline orchestration.
//!
//! A single task owns every registry write. It waits on three sources:
//! shutdown, MQTT session events and BLE advertisements. Each advertisement
//! goes through grammar, allowlist and registry; publishing only happens
//! while the session is up. After every (re)connect the bridge announces
//! itself, then replays discovery and state for all known tanks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use otobridge_common::{RawAdvertisement, TopicBuilder};
use otobridge_framework::{
    AvailabilityMonitor, BridgeInfo, BridgeStatus, Publisher, SessionEvent, Transport, run_step,
};

use crate::config::{BridgeSettings, OtobridgeConfig};
use crate::discovery::DiscoveryPublisher;
use crate::parser::AdvertisementGrammar;
use crate::registry::{DeviceRegistry, ObservationResult, SharedRegistry, TankDevice};

/// Pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Advertisements received from the scanner.
    pub advertisements: u64,
    /// Advertisements decoded into readings.
    pub parsed: u64,
    /// Advertisements rejected by the grammar.
    pub rejected: u64,
    /// Readings dropped by the serial allowlist.
    pub filtered: u64,
    /// Advertisements lost because the bridge fell behind.
    pub lagged: u64,
    /// Successful state publishes.
    pub published: u64,
    /// Failed discovery, state or availability publishes.
    pub publish_failures: u64,
}

/// What happened to one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Rejected by the grammar, with its reason code.
    Rejected(&'static str),
    /// Serial not in the allowlist.
    Filtered,
    /// Recorded in the registry, with the observation kind.
    Observed(&'static str),
}

/// The bridge orchestrator.
pub struct Bridge<T> {
    name: String,
    version: String,
    started_at: DateTime<Utc>,
    grammar: Box<dyn AdvertisementGrammar>,
    registry: SharedRegistry,
    discovery: DiscoveryPublisher<T>,
    publisher: Publisher<T>,
    availability: AvailabilityMonitor,
    settings: BridgeSettings,
    birth_topic: String,
    stats: BridgeStats,
}

impl<T: Transport> Bridge<T> {
    /// Create a bridge from configuration.
    ///
    /// `availability` must already have its will registered with the session
    /// behind `publisher`.
    pub fn new(
        config: &OtobridgeConfig,
        publisher: Publisher<T>,
        availability: AvailabilityMonitor,
    ) -> Self {
        let settings = config.bridge.clone();
        let grammar = config.ble.grammar.build(&config.ble.name_prefix);
        tracing::info!(grammar = grammar.name(), "Advertisement grammar");

        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
            grammar,
            registry: DeviceRegistry::new(settings.heartbeat()).shared(),
            discovery: DiscoveryPublisher::new(publisher.clone(), settings.discovery()),
            publisher,
            availability,
            birth_topic: TopicBuilder::new(&settings.discovery_prefix, &settings.state_prefix)
                .birth_topic(),
            settings,
            stats: BridgeStats::default(),
        }
    }

    /// Override the start time reported in the info document.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Shared registry handle for diagnostics.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Counters so far.
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Availability monitor.
    pub fn availability(&self) -> &AvailabilityMonitor {
        &self.availability
    }

    /// Run the pipeline until `shutdown` turns true.
    ///
    /// Returning stops advertisement consumption; call
    /// [`finish`](Self::finish) next.
    pub async fn run(
        mut self,
        mut adverts: broadcast::Receiver<RawAdvertisement>,
        mut events: mpsc::Receiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut adverts_open = true;

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                Some(event) = events.recv() => self.handle_session_event(event).await,

                advert = adverts.recv(), if adverts_open => match advert {
                    Ok(advert) => {
                        self.handle_advertisement(advert).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        self.stats.lagged += skipped;
                        tracing::warn!(skipped, "Bridge fell behind, dropped oldest advertisements");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Advertisement channel closed");
                        adverts_open = false;
                    }
                },
            }
        }

        tracing::info!("Stopped consuming advertisements");
        self
    }

    /// Publish the final `offline`, bounded by `step_timeout`.
    ///
    /// Returns the final counters.
    pub async fn finish(mut self, step_timeout: std::time::Duration) -> BridgeStats {
        if let Some(status) = self.availability.begin_shutdown() {
            let publish = self.discovery.publish_availability(status);
            match run_step("publish offline", step_timeout, publish).await {
                Some(Ok(())) => tracing::info!("Published offline"),
                Some(Err(e)) => {
                    self.stats.publish_failures += 1;
                    tracing::warn!(error = %e, "Failed to publish offline");
                }
                None => self.stats.publish_failures += 1,
            }
        }
        self.stats
    }

    /// Route one advertisement through grammar, allowlist and registry.
    pub async fn handle_advertisement(&mut self, advert: RawAdvertisement) -> Outcome {
        self.stats.advertisements += 1;

        let reading = match self.grammar.parse(&advert) {
            Ok(reading) => reading,
            Err(e) => {
                self.stats.rejected += 1;
                tracing::debug!(
                    address = %advert.address,
                    reason = e.reason(),
                    error = %e,
                    "Discarded advertisement"
                );
                return Outcome::Rejected(e.reason());
            }
        };
        self.stats.parsed += 1;

        if !self.settings.allows(&reading.serial) {
            self.stats.filtered += 1;
            tracing::debug!(serial = %reading.serial, "Serial not in allowlist");
            return Outcome::Filtered;
        }

        let serial = reading.serial.clone();
        let result = {
            let mut registry = self.registry.write().await;
            let result = registry.observe(reading);
            registry.set_address(&serial, advert.address);
            result
        };

        tracing::debug!(serial = %serial, observation = result.kind(), "Observed tank");

        if self.availability.is_online() {
            let heartbeat_or_change = matches!(result, ObservationResult::Updated { .. });
            self.publish_device(result.device(), false, heartbeat_or_change)
                .await;
        }

        Outcome::Observed(result.kind())
    }

    /// React to a change on the MQTT session.
    pub async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connecting => self.availability.on_connecting(),
            SessionEvent::Connected { .. } => match self.availability.on_connected() {
                Ok(status) => {
                    if let Err(e) = self.discovery.publish_availability(status).await {
                        self.stats.publish_failures += 1;
                        tracing::warn!(error = %e, "Failed to publish online");
                    }
                    self.publish_info().await;
                    self.republish_all().await;
                }
                Err(e) => tracing::warn!(error = %e, "Not going online"),
            },
            SessionEvent::Disconnected(reason) => self.availability.on_disconnected(reason),
            SessionEvent::Message {
                topic,
                payload,
                retain,
            } => {
                if topic == self.birth_topic && retain {
                    // Replayed on every (re)subscribe; Connected already republished.
                    tracing::debug!(topic = %topic, "Ignoring retained birth message");
                } else if topic == self.birth_topic && payload.trim_ascii() == b"online" {
                    tracing::info!("Home Assistant came online, re-announcing tanks");
                    if self.availability.is_online() {
                        self.republish_all().await;
                    }
                } else {
                    tracing::debug!(topic = %topic, "Ignoring message");
                }
            }
        }
    }

    /// Publish discovery and state for every known tank.
    pub async fn republish_all(&mut self) {
        let devices: Vec<TankDevice> = self.registry.read().await.devices().cloned().collect();
        tracing::info!(devices = devices.len(), "Republishing all tanks");
        for device in &devices {
            self.publish_device(device, true, true).await;
        }
    }

    /// Publish the retained diagnostics document.
    pub async fn publish_info(&mut self) {
        let status = if self.availability.is_online() {
            BridgeStatus::Online
        } else {
            BridgeStatus::Offline
        };
        let devices = self.registry.read().await.summary();
        let info = BridgeInfo::new(&self.name, &self.version, status, self.started_at)
            .with_metadata(serde_json::json!({
                "devices": devices,
                "stats": self.stats,
            }));

        if let Err(e) = info.publish(&self.publisher, &self.settings.info_topic).await {
            self.stats.publish_failures += 1;
            tracing::warn!(error = %e, "Failed to publish bridge info");
        }
    }

    /// Discovery first, then state; registry is only updated on success.
    async fn publish_device(&mut self, device: &TankDevice, force_discovery: bool, force_state: bool) {
        let unannounced = device.unannounced(self.settings.publish_rssi);
        let needs_discovery = force_discovery || !device.discovered || !unannounced.is_empty();
        let mut announced_new_device = false;

        if needs_discovery {
            match self.discovery.publish_discovery(device).await {
                Ok(kinds) => {
                    announced_new_device = !device.discovered;
                    self.registry
                        .write()
                        .await
                        .mark_discovered(&device.serial, &kinds);
                }
                Err(e) => {
                    self.stats.publish_failures += 1;
                    tracing::warn!(serial = %device.serial, error = %e, "Failed to publish discovery");
                    return;
                }
            }
        }

        if force_state || needs_discovery || device.state_pending {
            match self.discovery.publish_state(device).await {
                Ok(()) => {
                    self.stats.published += 1;
                    self.registry
                        .write()
                        .await
                        .mark_published(&device.serial, Utc::now());
                }
                Err(e) => {
                    self.stats.publish_failures += 1;
                    tracing::warn!(serial = %device.serial, error = %e, "Failed to publish state");
                }
            }
        }

        if announced_new_device {
            self.publish_info().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otobridge_framework::{AvailabilityState, MemoryBroker};

    fn setup(config: OtobridgeConfig) -> (MemoryBroker, Bridge<MemoryBroker>) {
        let broker = MemoryBroker::new();
        let mut availability = AvailabilityMonitor::new(config.bridge.status_topic.clone());
        broker.connect(Some(availability.register_will()));
        let bridge = Bridge::new(&config, Publisher::new(broker.clone()), availability);
        (broker, bridge)
    }

    fn tank(name: &str) -> RawAdvertisement {
        RawAdvertisement::new("AA:BB:CC:DD:EE:FF")
            .with_name(name)
            .with_rssi(-70)
    }

    #[tokio::test]
    async fn test_offline_sightings_update_registry_only() {
        let (broker, mut bridge) = setup(OtobridgeConfig::default());

        let outcome = bridge.handle_advertisement(tank("OTO sn:A1 lvl:50")).await;
        assert_eq!(outcome, Outcome::Observed("new"));
        assert!(broker.published().is_empty());
        assert_eq!(bridge.registry().read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_publishes_online_then_known_devices() {
        let (broker, mut bridge) = setup(OtobridgeConfig::default());
        bridge.handle_advertisement(tank("OTO sn:A1 lvl:50")).await;

        bridge
            .handle_session_event(SessionEvent::Connected {
                session_present: false,
            })
            .await;

        let topics: Vec<String> = broker.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics[0], "otodata/bridge/status");
        assert!(topics.contains(&"homeassistant/sensor/A1/level/config".to_string()));
        assert!(topics.contains(&"otodata/sensor/A1/level/state".to_string()));
        assert!(topics.contains(&"otodata/bridge/info".to_string()));

        let device = bridge.registry().read().await.get("A1").cloned().unwrap();
        assert!(device.discovered);
        assert!(!device.state_pending);
    }

    #[tokio::test]
    async fn test_rejections_and_allowlist_are_counted() {
        let mut config = OtobridgeConfig::default();
        config.bridge.serial_allowlist = vec!["MINE".to_string()];
        let (_, mut bridge) = setup(config);

        assert_eq!(
            bridge.handle_advertisement(tank("Headphones")).await,
            Outcome::Rejected("unrecognized-format")
        );
        assert_eq!(
            bridge.handle_advertisement(tank("OTO sn:MINE lvl:101")).await,
            Outcome::Rejected("field-out-of-range")
        );
        assert_eq!(
            bridge.handle_advertisement(tank("OTO sn:THEIRS lvl:10")).await,
            Outcome::Filtered
        );

        let stats = bridge.stats();
        assert_eq!(stats.advertisements, 3);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.parsed, 1);
        assert_eq!(stats.filtered, 1);
        assert!(bridge.registry().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_discovery_is_retried_on_next_sighting() {
        let (broker, mut bridge) = setup(OtobridgeConfig::default());
        bridge
            .handle_session_event(SessionEvent::Connected {
                session_present: false,
            })
            .await;

        broker.set_failing(true);
        bridge.handle_advertisement(tank("OTO sn:A1 lvl:50")).await;
        assert!(!bridge.registry().read().await.get("A1").unwrap().discovered);
        assert!(bridge.stats().publish_failures >= 1);

        broker.set_failing(false);
        bridge.handle_advertisement(tank("OTO sn:A1 lvl:50")).await;
        assert!(bridge.registry().read().await.get("A1").unwrap().discovered);
        assert_eq!(
            broker
                .retained_str("otodata/sensor/A1/level/state")
                .as_deref(),
            Some(r#"{"level":50}"#)
        );
    }

    #[tokio::test]
    async fn test_new_entity_triggers_reannounce() {
        let (broker, mut bridge) = setup(OtobridgeConfig::default());
        bridge
            .handle_session_event(SessionEvent::Connected {
                session_present: false,
            })
            .await;

        bridge.handle_advertisement(tank("OTO sn:A1 lvl:50")).await;
        assert!(broker.retained("homeassistant/sensor/A1/battery/config").is_none());

        bridge.handle_advertisement(tank("OTO sn:A1 lvl:50 bat:80")).await;
        assert!(broker.retained("homeassistant/sensor/A1/battery/config").is_some());
        assert_eq!(
            broker
                .retained_str("otodata/sensor/A1/battery/state")
                .as_deref(),
            Some(r#"{"battery":80}"#)
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_finish() {
        let (broker, mut bridge) = setup(OtobridgeConfig::default());
        bridge
            .handle_session_event(SessionEvent::Connected {
                session_present: false,
            })
            .await;
        bridge
            .handle_session_event(SessionEvent::Disconnected("reset".to_string()))
            .await;
        assert!(matches!(
            bridge.availability().state(),
            AvailabilityState::Offline(_)
        ));

        bridge.handle_session_event(SessionEvent::Connecting).await;
        bridge
            .handle_session_event(SessionEvent::Connected {
                session_present: false,
            })
            .await;
        broker.clear_log();

        let stats = bridge.finish(std::time::Duration::from_secs(1)).await;
        assert_eq!(stats.publish_failures, 0);
        assert_eq!(
            broker.retained_str("otodata/bridge/status").as_deref(),
            Some("offline")
        );
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, bridge) = setup(OtobridgeConfig::default());
        let (adverts_tx, adverts_rx) = broadcast::channel(8);
        let (_events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        adverts_tx.send(tank("OTO sn:A1 lvl:50")).unwrap();
        let handle = tokio::spawn(bridge.run(adverts_rx, events_rx, shutdown_rx));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let bridge = handle.await.unwrap();
        assert_eq!(bridge.stats().advertisements, 1);
    }

    #[tokio::test]
    async fn test_lagged_advertisements_are_counted() {
        let (_, bridge) = setup(OtobridgeConfig::default());
        let (adverts_tx, adverts_rx) = broadcast::channel(2);
        let (_events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for level in 0..5 {
            adverts_tx
                .send(tank(&format!("OTO sn:A1 lvl:{level}")))
                .unwrap();
        }
        let handle = tokio::spawn(bridge.run(adverts_rx, events_rx, shutdown_rx));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let bridge = handle.await.unwrap();
        assert_eq!(bridge.stats().lagged, 3);
        assert_eq!(bridge.stats().advertisements, 2);
    }
}
