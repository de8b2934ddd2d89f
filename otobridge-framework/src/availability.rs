//! Bridge availability and Last-Will-and-Testament.
//!
//! Every entity the bridge announces points its availability at a single
//! retained status topic, so one flip of that topic marks all of them
//! available or unavailable together.
//!
//! The broker publishes `offline` on our behalf if the session dies without
//! a clean disconnect. That will is part of the CONNECT packet, so it must be
//! registered before `online` is ever published: [`AvailabilityMonitor`]
//! refuses to go online until [`AvailabilityMonitor::register_will`] has run.
//!
//! ```text
//! Connecting --connack--> Online --drop--> Offline(reason) --retry--> Connecting
//!      \___________________________ shutdown ___________________________> Stopped
//! ```

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Bridge-wide status published on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Online,
    Offline,
}

impl BridgeStatus {
    /// Payload text.
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Online => "online",
            BridgeStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A Last-Will-and-Testament registered with the broker at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Availability state of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityState {
    /// Waiting for the broker to accept the session.
    Connecting,
    /// Session established and `online` published.
    Online,
    /// Session lost; the broker has fired the will.
    Offline(String),
    /// Process is shutting down.
    Stopped,
}

/// Tracks the bridge's own availability and owns its will.
#[derive(Debug)]
pub struct AvailabilityMonitor {
    topic: String,
    state: AvailabilityState,
    will_registered: bool,
}

impl AvailabilityMonitor {
    /// Create a monitor for the given status topic.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: AvailabilityState::Connecting,
            will_registered: false,
        }
    }

    /// Status topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current state.
    pub fn state(&self) -> &AvailabilityState {
        &self.state
    }

    /// Whether the bridge is currently online.
    pub fn is_online(&self) -> bool {
        self.state == AvailabilityState::Online
    }

    /// Build the will for the session: `offline`, QoS 1, retained.
    ///
    /// Must be passed to the session's CONNECT before [`on_connected`](Self::on_connected).
    pub fn register_will(&mut self) -> Will {
        self.will_registered = true;
        Will {
            topic: self.topic.clone(),
            payload: BridgeStatus::Offline.as_str().as_bytes().to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }

    /// A new connection attempt is starting.
    pub fn on_connecting(&mut self) {
        if matches!(self.state, AvailabilityState::Offline(_)) {
            tracing::debug!(topic = %self.topic, "Reconnecting");
            self.state = AvailabilityState::Connecting;
        }
    }

    /// The broker accepted the session.
    ///
    /// Returns the status to publish. Fails if no will was registered.
    pub fn on_connected(&mut self) -> Result<BridgeStatus> {
        if !self.will_registered {
            return Err(BridgeError::Availability(
                "refusing to publish online before the will is registered".to_string(),
            ));
        }
        if self.state == AvailabilityState::Stopped {
            return Err(BridgeError::Availability(
                "bridge is shutting down".to_string(),
            ));
        }
        tracing::info!(topic = %self.topic, "Bridge online");
        self.state = AvailabilityState::Online;
        Ok(BridgeStatus::Online)
    }

    /// The session dropped.
    pub fn on_disconnected(&mut self, reason: impl Into<String>) {
        if self.state == AvailabilityState::Stopped {
            return;
        }
        let reason = reason.into();
        tracing::warn!(topic = %self.topic, reason = %reason, "Bridge offline");
        self.state = AvailabilityState::Offline(reason);
    }

    /// Enter the terminal state.
    ///
    /// Returns the status for the final best-effort publish, or `None` if the
    /// session is not up (the will already covers that case) or shutdown
    /// already began.
    pub fn begin_shutdown(&mut self) -> Option<BridgeStatus> {
        let previous = std::mem::replace(&mut self.state, AvailabilityState::Stopped);
        match previous {
            AvailabilityState::Online => Some(BridgeStatus::Offline),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_will_is_retained_offline() {
        let mut monitor = AvailabilityMonitor::new("otodata/bridge/status");
        let will = monitor.register_will();

        assert_eq!(will.topic, "otodata/bridge/status");
        assert_eq!(will.payload, b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_online_requires_will() {
        let mut monitor = AvailabilityMonitor::new("otodata/bridge/status");
        assert!(matches!(
            monitor.on_connected(),
            Err(BridgeError::Availability(_))
        ));
        assert_eq!(monitor.state(), &AvailabilityState::Connecting);

        monitor.register_will();
        assert_eq!(monitor.on_connected().unwrap(), BridgeStatus::Online);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_state_machine_cycle() {
        let mut monitor = AvailabilityMonitor::new("s");
        monitor.register_will();
        monitor.on_connected().unwrap();

        monitor.on_disconnected("connection reset");
        assert_eq!(
            monitor.state(),
            &AvailabilityState::Offline("connection reset".to_string())
        );

        monitor.on_connecting();
        assert_eq!(monitor.state(), &AvailabilityState::Connecting);

        monitor.on_connected().unwrap();
        assert!(monitor.is_online());
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut monitor = AvailabilityMonitor::new("s");
        monitor.register_will();
        monitor.on_connected().unwrap();

        assert_eq!(monitor.begin_shutdown(), Some(BridgeStatus::Offline));
        assert_eq!(monitor.begin_shutdown(), None);

        monitor.on_disconnected("late");
        assert_eq!(monitor.state(), &AvailabilityState::Stopped);
        assert!(monitor.on_connected().is_err());
    }

    #[test]
    fn test_shutdown_while_disconnected_skips_publish() {
        let mut monitor = AvailabilityMonitor::new("s");
        monitor.register_will();
        assert_eq!(monitor.begin_shutdown(), None);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(BridgeStatus::Online.to_string(), "online");
        assert_eq!(
            serde_json::to_string(&BridgeStatus::Offline).unwrap(),
            "\"offline\""
        );
    }
}
