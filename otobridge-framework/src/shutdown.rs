//! Shutdown signal handling and bounded shutdown steps.

use std::future::Future;
use std::time::Duration;

/// Wait for Ctrl+C or, on Unix, SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Run one shutdown step, giving up after `timeout`.
///
/// Returns `None` if the step timed out.
pub async fn run_step<F>(name: &str, timeout: Duration, step: F) -> Option<F::Output>
where
    F: Future,
{
    tracing::debug!(step = name, "Shutdown step");
    match tokio::time::timeout(timeout, step).await {
        Ok(output) => Some(output),
        Err(_) => {
            tracing::warn!(
                step = name,
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown step timed out"
            );
            None
        }
    }
}
