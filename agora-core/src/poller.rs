/// Polling fallback
///
/// A fixed-interval refresh loop feeding the same reconciler as push. It
/// covers transports without push and push connections that silently stall.
/// The first tick fires one interval after start, since `open` has just
/// fetched history.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Run `tick` every `period` until cancelled or until `tick` returns false.
pub fn spawn<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    tokio::spawn(async move {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    if !tick().await {
                        break;
                    }
                }
            }
        }
        log::debug!("Poller stopped");
    })
}
