//! Process lifecycle helpers.

use tokio::signal;
use tracing::info;

/// Resolves when the process is asked to stop (Ctrl+C, or SIGTERM on unix).
///
/// Handed to `axum::serve(..).with_graceful_shutdown(..)` so in-flight
/// requests drain before the listener closes.
///
/// # Panics
///
/// Panics if a signal handler cannot be installed; without one the process
/// could never be stopped cleanly, so failing loudly at startup is the
/// right outcome.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate())
            .unwrap_or_else(|e| panic!("cannot install SIGTERM handler: {e}"));
        stream.recv().await;
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<&str>();

    let received = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                panic!("cannot install Ctrl+C handler: {e}");
            }
            "Ctrl+C"
        }
        name = sigterm => name,
    };

    info!(signal = received, "Shutdown signal received, draining in-flight requests");
}
