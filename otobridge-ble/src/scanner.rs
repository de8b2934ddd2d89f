//! BLE advertisement scanner.
//!
//! Runs a passive scan on its own task and turns every adapter event into a
//! [`RawAdvertisement`] snapshot of the peripheral's current properties.
//! Snapshots go into a broadcast channel: when the bridge falls behind, the
//! oldest sightings are dropped, which is harmless since the next
//! advertisement from the same tank supersedes them.
//!
//! The scanner has its own backoff. A failed or idle scan is restarted
//! (re-resolving the adapter) without involving the MQTT side.

use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use otobridge_common::{Backoff, RawAdvertisement};

use crate::config::BleConfig;

/// Scanner errors.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Error from the BLE stack.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The host has no BLE adapter.
    #[error("no BLE adapter available")]
    NoAdapter,

    /// No adapter matched the configured selector.
    #[error("no BLE adapter matching '{0}'")]
    AdapterNotFound(String),

    /// The adapter event stream closed.
    #[error("BLE event stream ended")]
    StreamEnded,
}

/// How a scan session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    /// Shutdown was requested.
    Stopped,
    /// No event within the idle timeout.
    Idle,
}

/// Resolve the adapter to scan with.
///
/// Picks the first adapter, or the first whose description contains
/// `selector`.
pub async fn open_adapter(selector: Option<&str>) -> Result<Adapter, ScanError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    if adapters.is_empty() {
        return Err(ScanError::NoAdapter);
    }

    for adapter in adapters {
        let info = adapter.adapter_info().await?;
        match selector {
            Some(selector) if !info.contains(selector) => {
                tracing::debug!(adapter = %info, "Skipping adapter");
            }
            _ => {
                tracing::info!(adapter = %info, "Using BLE adapter");
                return Ok(adapter);
            }
        }
    }

    Err(ScanError::AdapterNotFound(
        selector.unwrap_or_default().to_string(),
    ))
}

/// Convert peripheral properties into an advertisement snapshot.
pub fn to_advertisement(properties: PeripheralProperties) -> RawAdvertisement {
    RawAdvertisement {
        address: properties.address.to_string(),
        rssi: properties.rssi,
        local_name: properties.local_name,
        manufacturer_data: properties.manufacturer_data,
    }
}

fn peripheral_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
        CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

/// Passive BLE scanner feeding a broadcast channel.
pub struct Scanner {
    adapter: Adapter,
    config: BleConfig,
}

impl Scanner {
    /// Open the configured adapter. Fails if none is usable.
    pub async fn open(config: &BleConfig) -> Result<Self, ScanError> {
        let adapter = open_adapter(config.adapter.as_deref()).await?;
        Ok(Self {
            adapter,
            config: config.clone(),
        })
    }

    /// Scan until `stop` turns true, restarting after failures.
    pub async fn run(
        mut self,
        tx: broadcast::Sender<RawAdvertisement>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ScanError> {
        let mut backoff = Backoff::new(&self.config.rescan);

        while !*stop.borrow() {
            match self.scan_session(&tx, &mut stop, &mut backoff).await {
                Ok(ScanEnd::Stopped) => break,
                Ok(ScanEnd::Idle) => {
                    tracing::warn!(
                        idle_secs = self.config.idle_restart_secs,
                        "No BLE events, restarting scan"
                    );
                }
                Err(e) => tracing::warn!(error = %e, "BLE scan failed"),
            }

            if let Err(e) = self.adapter.stop_scan().await {
                tracing::debug!(error = %e, "Failed to stop scan before restart");
            }

            let delay = backoff.next_delay();
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "Restarting BLE scan"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }

            match open_adapter(self.config.adapter.as_deref()).await {
                Ok(adapter) => self.adapter = adapter,
                Err(e) => tracing::warn!(error = %e, "Failed to re-resolve adapter"),
            }
        }

        self.adapter.stop_scan().await?;
        tracing::info!("BLE scan stopped");
        Ok(())
    }

    async fn scan_session(
        &self,
        tx: &broadcast::Sender<RawAdvertisement>,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<ScanEnd, ScanError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        tracing::info!("BLE scan started");

        let idle = self.config.idle_restart();
        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(ScanEnd::Stopped),
                next = tokio::time::timeout(idle, events.next()) => match next {
                    Err(_) => return Ok(ScanEnd::Idle),
                    Ok(None) => return Err(ScanError::StreamEnded),
                    Ok(Some(event)) => {
                        backoff.reset();
                        let Some(id) = peripheral_id(event) else {
                            continue;
                        };
                        if let Some(advert) = self.snapshot(&id).await {
                            // No receiver only happens during shutdown.
                            let _ = tx.send(advert);
                        }
                    }
                },
            }
        }
    }

    async fn snapshot(&self, id: &PeripheralId) -> Option<RawAdvertisement> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        match peripheral.properties().await {
            Ok(Some(properties)) => Some(to_advertisement(properties)),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read peripheral properties");
                None
            }
        }
    }
}
