//! In-memory broker for tests and dry runs.
//!
//! Records every publish, keeps a retained store, and models the broker side
//! of the Last-Will-and-Testament: the will registered at connect time is
//! published only when the connection drops without a clean disconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rumqttc::QoS;

use crate::availability::Will;
use crate::error::{BridgeError, Result};
use crate::publisher::Transport;

/// One message seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Published {
    /// Payload as UTF-8 text (empty if not valid UTF-8).
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    connected: bool,
    will: Option<Will>,
    retained: HashMap<String, Vec<u8>>,
    log: Vec<Published>,
    failing: bool,
}

impl BrokerState {
    fn deliver(&mut self, message: Published) {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained
                    .insert(message.topic.clone(), message.payload.clone());
            }
        }
        self.log.push(message);
    }
}

/// Shared handle to an in-memory broker.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create a disconnected broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session, registering its will.
    pub fn connect(&self, will: Option<Will>) {
        let mut state = self.state();
        state.connected = true;
        state.will = will;
    }

    /// Clean disconnect: the will is discarded.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.will = None;
    }

    /// Unclean drop (crash, network partition): the broker publishes the will.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.connected = false;
        if let Some(will) = state.will.take() {
            state.deliver(Published {
                topic: will.topic,
                payload: will.payload,
                qos: will.qos,
                retain: will.retain,
            });
        }
    }

    /// Make every publish fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Will registered by the current session.
    pub fn will(&self) -> Option<Will> {
        self.state().will.clone()
    }

    /// Retained payload for a topic.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state().retained.get(topic).cloned()
    }

    /// Retained payload for a topic as text.
    pub fn retained_str(&self, topic: &str) -> Option<String> {
        self.retained(topic)
            .map(|payload| String::from_utf8_lossy(&payload).into_owned())
    }

    /// All messages in delivery order.
    pub fn published(&self) -> Vec<Published> {
        self.state().log.clone()
    }

    /// Messages delivered to one topic.
    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.state()
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Forget the delivery log (retained store is kept).
    pub fn clear_log(&self) {
        self.state().log.clear();
    }
}

impl Transport for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(BridgeError::publish(topic, "not connected"));
        }
        if state.failing {
            return Err(BridgeError::publish(topic, "simulated failure"));
        }
        state.deliver(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn offline_will() -> Will {
        Will {
            topic: "otodata/bridge/status".to_string(),
            payload: b"offline".to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }

    #[tokio::test]
    async fn test_unclean_drop_publishes_will() {
        let broker = MemoryBroker::new();
        broker.connect(Some(offline_will()));
        assert_ok!(
            broker
                .publish("otodata/bridge/status", b"online".to_vec(), QoS::AtLeastOnce, true)
                .await
        );

        broker.drop_connection();

        assert_eq!(
            broker.retained_str("otodata/bridge/status").as_deref(),
            Some("offline")
        );
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_clean_disconnect_discards_will() {
        let broker = MemoryBroker::new();
        broker.connect(Some(offline_will()));
        assert_ok!(
            broker
                .publish("otodata/bridge/status", b"online".to_vec(), QoS::AtLeastOnce, true)
                .await
        );

        broker.disconnect();

        assert_eq!(
            broker.retained_str("otodata/bridge/status").as_deref(),
            Some("online")
        );
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = MemoryBroker::new();
        let err = assert_err!(
            broker
                .publish("t", b"x".to_vec(), QoS::AtMostOnce, false)
                .await
        );
        assert!(matches!(err, BridgeError::Publish { .. }));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_empty_retained_payload_clears_topic() {
        let broker = MemoryBroker::new();
        broker.connect(None);
        broker
            .publish("t", b"x".to_vec(), QoS::AtLeastOnce, true)
            .await
            .unwrap();
        broker
            .publish("t", Vec::new(), QoS::AtLeastOnce, true)
            .await
            .unwrap();

        assert!(broker.retained("t").is_none());
        assert_eq!(broker.published_to("t").len(), 2);
    }
}
