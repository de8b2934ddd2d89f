//! MQTT session driver.
//!
//! Wraps a `rumqttc` client and event loop. The event loop runs on its own
//! task and reports connection changes and incoming messages as
//! [`SessionEvent`]s; the bridge never touches the event loop directly.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use otobridge_common::{Backoff, MqttConfig};

use crate::availability::Will;
use crate::error::{BridgeError, Result};
use crate::publisher::Transport;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened on the MQTT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection attempt is starting.
    Connecting,
    /// The broker accepted the session; subscriptions have been re-issued.
    Connected { session_present: bool },
    /// An established session dropped.
    Disconnected(String),
    /// A message arrived on a subscribed topic. `retain` is set when the
    /// broker replayed a stored message because of a fresh subscription.
    Message {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
}

impl From<&Will> for LastWill {
    fn from(will: &Will) -> Self {
        LastWill::new(will.topic.clone(), will.payload.clone(), will.qos, will.retain)
    }
}

/// Build client options from configuration, carrying the will in CONNECT.
pub fn mqtt_options(config: &MqttConfig, will: &Will) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    options.set_last_will(LastWill::from(will));

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        options.set_credentials(username, password);
    }

    options
}

/// A running MQTT session.
pub struct MqttSession {
    client: AsyncClient,
    publish_timeout: Duration,
    driver: JoinHandle<()>,
}

impl MqttSession {
    /// Start the session.
    ///
    /// Returns the session handle and the receiver of its events. The first
    /// event is always [`SessionEvent::Connecting`].
    pub fn start(
        config: &MqttConfig,
        will: &Will,
        subscriptions: Vec<String>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let options = mqtt_options(config, will);
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            will_topic = %will.topic,
            "Starting MQTT session"
        );

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            subscriptions,
            Backoff::new(&config.reconnect),
            events_tx,
        ));

        (
            Self {
                client,
                publish_timeout: config.publish_timeout(),
                driver,
            },
            events_rx,
        )
    }

    /// Transport for publishing on this session.
    pub fn transport(&self) -> MqttTransport {
        MqttTransport {
            client: self.client.clone(),
            publish_timeout: self.publish_timeout,
        }
    }

    /// Send DISCONNECT and wait for the driver to finish.
    ///
    /// A clean DISCONNECT makes the broker discard the will. If the driver
    /// does not finish within `timeout` it is aborted.
    pub async fn close(self, timeout: Duration) -> Result<()> {
        let disconnect = tokio::time::timeout(timeout, self.client.disconnect()).await;

        let result = match disconnect {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Session(format!("disconnect failed: {}", e))),
            Err(_) => Err(BridgeError::Session("disconnect timed out".to_string())),
        };

        let mut driver = self.driver;
        if tokio::time::timeout(timeout, &mut driver).await.is_err() {
            tracing::warn!("MQTT driver did not stop in time, aborting");
            driver.abort();
        }

        result
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    mut backoff: Backoff,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut connected = false;
    let _ = events.send(SessionEvent::Connecting).await;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    tracing::warn!(code = ?ack.code, "Broker refused connection");
                    continue;
                }

                backoff.reset();
                connected = true;
                tracing::info!(session_present = ack.session_present, "MQTT connected");

                for topic in &subscriptions {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        tracing::warn!(topic = %topic, error = %e, "Failed to subscribe");
                    }
                }

                let _ = events
                    .send(SessionEvent::Connected {
                        session_present: ack.session_present,
                    })
                    .await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = events
                    .send(SessionEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    })
                    .await;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected {
                    connected = false;
                    tracing::warn!(error = %e, "MQTT connection lost");
                    let _ = events.send(SessionEvent::Disconnected(e.to_string())).await;
                } else {
                    tracing::debug!(error = %e, "MQTT connection attempt failed");
                }

                let delay = backoff.next_delay();
                tracing::debug!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = backoff.attempts(),
                    "Waiting before reconnect"
                );
                tokio::time::sleep(delay).await;
                let _ = events.send(SessionEvent::Connecting).await;
            }
        }
    }
}

/// [`Transport`] over a live `rumqttc` client.
///
/// Publishing only queues the request; if the queue stays full for longer
/// than the publish timeout the publish fails instead of blocking the caller.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    publish_timeout: Duration,
}

impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        let request = self.client.publish(topic, qos, retain, payload);
        match tokio::time::timeout(self.publish_timeout, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::publish(topic, e.to_string())),
            Err(_) => Err(BridgeError::publish(
                topic,
                "request queue full, publish timed out",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn will() -> Will {
        Will {
            topic: "otodata/bridge/status".to_string(),
            payload: b"offline".to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }

    #[test]
    fn test_options_carry_will() {
        let options = mqtt_options(&MqttConfig::default(), &will());
        let last_will = options.last_will().unwrap();

        assert_eq!(last_will.topic, "otodata/bridge/status");
        assert_eq!(&last_will.message[..], b"offline");
        assert_eq!(last_will.qos, QoS::AtLeastOnce);
        assert!(last_will.retain);
    }

    #[test]
    fn test_options_connection_settings() {
        let config = MqttConfig {
            host: "broker.local".to_string(),
            port: 1884,
            keep_alive_secs: 45,
            ..Default::default()
        };
        let options = mqtt_options(&config, &will());

        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(options.client_id(), "otodata");
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
        assert!(options.credentials().is_none());
    }

    #[test]
    fn test_options_credentials() {
        let config = MqttConfig {
            username: Some("ha".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let options = mqtt_options(&config, &will());

        assert_eq!(
            options.credentials(),
            Some(("ha".to_string(), "secret".to_string()))
        );
    }

    #[tokio::test]
    async fn test_session_reports_connecting_first() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let (session, mut events) = MqttSession::start(&config, &will(), Vec::new());

        assert_eq!(events.recv().await, Some(SessionEvent::Connecting));

        let _ = session.close(Duration::from_millis(200)).await;
    }
}
