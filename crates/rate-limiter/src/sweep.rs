//! Background eviction of idle rate windows

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::window::RateLimiter;

/// Spawn a task that sweeps `limiter` every `interval`.
///
/// The task runs until the returned handle is aborted; the gateway aborts it
/// during shutdown.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Nothing to sweep at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = limiter.sweep();
            if removed > 0 {
                debug!(removed, tracked = limiter.tracked(), "swept idle rate windows");
            }
        }
    })
}
