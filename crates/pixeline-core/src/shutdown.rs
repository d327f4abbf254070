//! Graceful shutdown via a process-wide cancellation token

use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// Must be called from inside a tokio runtime. In-flight work selects on
/// `token.cancelled()` and is dropped promptly; outstanding lock leases are
/// left to expire by TTL.
pub fn install_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        log::warn!("Shutdown signal received, stopping...");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
