//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use otobridge_common::{LoggingConfig, init_tracing};

use crate::BridgeArgs;
use crate::availability::AvailabilityMonitor;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::publisher::Publisher;
use crate::session::{MqttSession, MqttTransport, SessionEvent};
use crate::shutdown::run_step;

/// Bridge runner that manages the lifecycle of the bridge process.
///
/// Handles:
/// - Logging initialization
/// - Registering the will and opening the MQTT session
/// - Worker task spawning and management
/// - Ordered shutdown (session close, then workers)
///
/// The availability monitor and the session event stream are handed to the
/// bridge's main loop with [`take_availability`](Self::take_availability) and
/// [`take_events`](Self::take_events).
///
/// # Example
///
/// ```ignore
/// use otobridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
///     let stop = runner.stop_signal();
///     runner.spawn_with_error("worker", my_worker(stop));
///
///     // ... drive the main loop with runner.take_events() ...
///
///     runner.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// MQTT session.
    session: MqttSession,
    /// Publishing transport shared by all publishers.
    transport: Arc<MqttTransport>,
    /// Session events, until taken by the main loop.
    events: Option<mpsc::Receiver<SessionEvent>>,
    /// Availability monitor, until taken by the main loop.
    availability: Option<AvailabilityMonitor>,
    /// Process start time.
    started_at: DateTime<Utc>,
    /// Signals workers to stop.
    stop_tx: watch::Sender<bool>,
    /// Spawned tasks.
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Register the will on the status topic
    /// 3. Start the MQTT session carrying that will
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                ..config.logging().clone()
            },
            None => config.logging().clone(),
        };

        if let Err(e) = init_tracing(&log_config) {
            tracing::debug!(error = %e, "Tracing already initialized");
        }

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let mut availability = AvailabilityMonitor::new(config.status_topic());
        let will = availability.register_will();

        let (session, events) = MqttSession::start(config.mqtt(), &will, config.subscriptions());
        let transport = Arc::new(session.transport());
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            name,
            version,
            config,
            session,
            transport,
            events: Some(events),
            availability: Some(availability),
            started_at: Utc::now(),
            stop_tx,
            tasks: Vec::new(),
        })
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Process start time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Upper bound for each shutdown step.
    pub fn step_timeout(&self) -> Duration {
        self.config.shutdown_step_timeout()
    }

    /// Get a publisher on the MQTT session.
    pub fn publisher(&self) -> Publisher<MqttTransport> {
        Publisher::from_arc(self.transport.clone())
    }

    /// Take the session event stream.
    ///
    /// Only the first call returns `Some`.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// Take the availability monitor (will already registered).
    ///
    /// Only the first call returns `Some`.
    pub fn take_availability(&mut self) -> Option<AvailabilityMonitor> {
        self.availability.take()
    }

    /// Receiver that flips to `true` when workers should stop.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Spawn a worker task.
    ///
    /// The task is awaited on shutdown and aborted if it does not stop in time.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push((name.into(), handle));
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let worker = name.clone();
        self.spawn(name, async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %worker, error = %e, "Worker failed");
            }
        });
    }

    /// Close the MQTT session, then stop the workers.
    ///
    /// Each step is bounded by [`step_timeout`](Self::step_timeout). Workers
    /// still running after the timeout are aborted.
    pub async fn shutdown(self) {
        let timeout = self.step_timeout();

        if let Err(e) = self.session.close(timeout).await {
            tracing::warn!(error = %e, "MQTT session did not close cleanly");
        }

        self.stop_tx.send_replace(true);
        for (name, mut handle) in self.tasks {
            if run_step(&name, timeout, &mut handle).await.is_none() {
                handle.abort();
            }
        }

        tracing::info!(bridge = %self.name, "Goodbye!");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otobridge_common::MqttConfig;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        mqtt: MqttConfig,
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn status_topic(&self) -> &str {
            "test/bridge/status"
        }

        fn shutdown_step_timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
    }

    fn unreachable_config() -> TestConfig {
        TestConfig {
            mqtt: MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ..Default::default()
            },
            logging: LoggingConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_runner_hands_out_main_loop_parts_once() {
        let mut runner = BridgeRunner::new("test", unreachable_config()).await.unwrap();

        let availability = runner.take_availability().unwrap();
        assert_eq!(availability.topic(), "test/bridge/status");
        assert!(runner.take_availability().is_none());

        assert!(runner.take_events().is_some());
        assert!(runner.take_events().is_none());

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let mut runner = BridgeRunner::new("test", unreachable_config()).await.unwrap();
        let stopped = Arc::new(AtomicBool::new(false));

        let mut stop = runner.stop_signal();
        let flag = stopped.clone();
        runner.spawn("watcher", async move {
            let _ = stop.wait_for(|stop| *stop).await;
            flag.store(true, Ordering::SeqCst);
        });

        runner.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_worker_is_aborted() {
        let mut runner = BridgeRunner::new("test", unreachable_config()).await.unwrap();
        runner.spawn("stuck", std::future::pending::<()>());

        let result = tokio::time::timeout(Duration::from_secs(5), runner.shutdown()).await;
        assert!(result.is_ok());
    }
}
