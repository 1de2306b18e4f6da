//! Poll loops for the two task kinds:
//! - `decision`: records inbound messages, replays, and commits decisions
//! - `side_effect`: runs side-effect attempts and reports their outcome

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{limits, Worker};
use crate::providers::Provider;

mod decision;
mod side_effect;

/// Renewal cadence for a lease.
///
/// - lease ≥ 15s: renew at (lease - buffer), at least every second
/// - lease < 15s: renew at half the lease (buffer ignored)
pub(crate) fn calculate_renewal_interval(lease: Duration, buffer: Duration) -> Duration {
    if lease >= limits::RENEWAL_BUFFER_THRESHOLD {
        lease.saturating_sub(buffer.min(lease)).max(Duration::from_secs(1))
    } else {
        (lease / 2).max(Duration::from_millis(10))
    }
}

/// Keeps `token` leased until aborted, shutdown, or a renewal fails.
pub(crate) fn spawn_lease_renewal_task(
    provider: Arc<dyn Provider>,
    token: String,
    lease: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lease, buffer);

    tracing::debug!(
        target: "reprise::runtime::side_effect",
        lease_token = %token,
        lease_ms = crate::millis(lease),
        renewal_interval_ms = crate::millis(renewal_interval),
        "spawning lease renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // first tick is immediate

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match provider.renew(&token, lease).await {
                Ok(()) => {
                    tracing::trace!(target: "reprise::runtime::side_effect", lease_token = %token, "lease renewed");
                }
                Err(e) => {
                    // Lease gone: acked, abandoned, or already expired.
                    tracing::debug!(
                        target: "reprise::runtime::side_effect",
                        lease_token = %token,
                        error = %e,
                        "lease renewal stopped"
                    );
                    break;
                }
            }
        }
    })
}

impl Worker {
    /// Acks a task, logging failures; an unacked task is redelivered after
    /// its lease expires and deduplicated then.
    async fn ack_quietly(&self, token: &str) {
        if let Err(e) = super::execute_with_retry(|| async { self.provider.ack(token).await }, "ack").await {
            tracing::warn!(target: "reprise::runtime", lease_token = %token, error = %e, "ack failed");
        }
    }

    async fn abandon_quietly(&self, token: &str, delay: Duration) {
        let delay = (!delay.is_zero()).then_some(delay);
        if let Err(e) = super::execute_with_retry(|| async { self.provider.abandon(token, delay).await }, "abandon").await {
            tracing::warn!(target: "reprise::runtime", lease_token = %token, error = %e, "abandon failed");
        }
    }
}
