//! Otodata BLE to MQTT bridge.
//!
//! Scans for tank monitor advertisements and publishes them to an MQTT
//! broker as Home Assistant sensors.

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};

use otobridge_ble::{Bridge, OtobridgeConfig, Scanner};
use otobridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner, wait_for_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("otobridge.json5");
    let config = OtobridgeConfig::load(&args.config)?;

    let mut runner = BridgeRunner::new_with_args("otobridge-ble", config, Some(&args))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let scanner = match Scanner::open(&runner.config().ble).await {
        Ok(scanner) => scanner,
        Err(e) => {
            tracing::error!(error = %e, "Cannot start BLE scanning");
            runner.shutdown().await;
            return Err(e.into());
        }
    };

    let (adverts_tx, adverts_rx) = broadcast::channel(runner.config().bridge.channel_capacity);
    let stop = runner.stop_signal();
    runner.spawn_with_error("ble-scanner", scanner.run(adverts_tx, stop));

    let availability = runner
        .take_availability()
        .context("availability monitor already taken")?;
    let events = runner
        .take_events()
        .context("session events already taken")?;

    let bridge = Bridge::new(runner.config(), runner.publisher(), availability)
        .with_started_at(runner.started_at());

    tracing::info!(
        status_topic = %runner.config().bridge.status_topic,
        discovery_prefix = %runner.config().bridge.discovery_prefix,
        "Bridge started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested");
        shutdown_tx.send_replace(true);
    });

    let bridge = bridge.run(adverts_rx, events, shutdown_rx).await;
    let stats = bridge.finish(runner.step_timeout()).await;
    runner.shutdown().await;

    tracing::info!(
        advertisements = stats.advertisements,
        parsed = stats.parsed,
        rejected = stats.rejected,
        filtered = stats.filtered,
        lagged = stats.lagged,
        published = stats.published,
        publish_failures = stats.publish_failures,
        "Final statistics"
    );

    Ok(())
}
