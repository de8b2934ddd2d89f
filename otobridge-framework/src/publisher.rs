//! Publishing seam between the bridge and the MQTT transport.

use std::future::Future;
use std::sync::Arc;

use rumqttc::QoS;

use crate::error::Result;

/// Something that can hand MQTT publishes to a broker.
///
/// Implemented by [`MqttTransport`](crate::MqttTransport) for a live session
/// and by [`MemoryBroker`](crate::MemoryBroker) for tests.
pub trait Transport: Send + Sync {
    /// Publish `payload` to `topic`.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Publisher for sending bridge messages over a [`Transport`].
///
/// Every publish uses the same QoS; the retain flag is chosen per call.
#[derive(Debug)]
pub struct Publisher<T> {
    transport: Arc<T>,
    qos: QoS,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            qos: self.qos,
        }
    }
}

impl<T: Transport> Publisher<T> {
    /// Create a new publisher using QoS 1.
    pub fn new(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// Create a publisher sharing an existing transport.
    pub fn from_arc(transport: Arc<T>) -> Self {
        Self {
            transport,
            qos: QoS::AtLeastOnce,
        }
    }

    /// Publish raw bytes.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.transport
            .publish(topic, payload, self.qos, retain)
            .await
    }

    /// Publish a retained payload.
    pub async fn publish_retained(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.publish_raw(topic, payload.into(), true).await
    }

    /// Publish a JSON value.
    pub async fn publish_json<V: serde::Serialize>(
        &self,
        topic: &str,
        value: &V,
        retain: bool,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(topic, payload, retain).await
    }
}
