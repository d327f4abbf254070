//! Bounded fixed-delay retry for establishing external connections

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionError, RetryPolicy};

/// Run a connect-style operation until it succeeds or attempts run out.
///
/// Sleeps `policy.delay` between attempts, never after the last one.
/// Exhaustion yields a [`ConnectionError`] naming `service`; callers at
/// start-up are expected to propagate it. Cancelling `shutdown` abandons the
/// in-flight attempt or sleep and returns [`ConnectionError::Cancelled`].
pub async fn retry_connect<T, E, F, Fut>(
    service: &str,
    policy: RetryPolicy,
    shutdown: &CancellationToken,
    mut action: F,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        if shutdown.is_cancelled() {
            log::info!("Shutdown requested, giving up on {service}");
            return Err(ConnectionError::cancelled(service, attempt));
        }
        attempt += 1;
        log::info!("Connecting to {service} (attempt {attempt}/{max_attempts})...");
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                log::info!("Shutdown requested, giving up on {service}");
                return Err(ConnectionError::cancelled(service, attempt));
            }
            r = action() => r,
        };
        match result {
            Ok(v) => {
                log::info!("Connected to {service}");
                return Ok(v);
            }
            Err(e) if attempt < max_attempts => {
                log::warn!(
                    "{service}: attempt {attempt}/{max_attempts} failed: {e}, retrying in {:?}",
                    policy.delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(policy.delay) => {}
                }
            }
            Err(e) => {
                log::error!("Could not connect to {service} after {max_attempts} attempts: {e}");
                return Err(ConnectionError::new(service, max_attempts, e));
            }
        }
    }
}
