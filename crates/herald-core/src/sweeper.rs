//! Cancellable periodic tasks.
//!
//! Idle eviction, rate-limit cleanup and notification expiry all run on a
//! fixed interval. Each sweep is also callable directly, so the loop here only
//! owns the timing and the shutdown signal.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Spawn `task` every `every` until `token` is cancelled.
///
/// The first run happens one full interval after spawning.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    token: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let every = every.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        debug!(task = name, interval_ms = every.as_millis() as u64, "Periodic task started");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = name, "Periodic task stopped");
                    break;
                }
                _ = ticker.tick() => task().await,
            }
        }
    })
}
