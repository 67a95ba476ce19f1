//! Background reaper for idle transfers.
//!
//! Periodically asks the dispatcher to sweep the transfer registry, and
//! evicts stale rate limiter entries on the same tick.

use crate::config::CleanupConfig;
use crate::server::{DropRelay, RelayCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};

/// Spawn the reaper.
///
/// Returns a handle that can be used to abort the task. The task exits on
/// its own when disabled or when the dispatcher stops.
pub fn spawn_reaper(relay: Arc<DropRelay>, config: CleanupConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Reaper disabled");
            return;
        }

        let period = Duration::from_secs(config.interval_secs.max(1));
        tracing::info!("Reaper started (interval: {}s)", period.as_secs());

        let mut timer = interval_at(Instant::now() + period, period);
        loop {
            timer.tick().await;

            if relay.submit(RelayCommand::Sweep).await.is_err() {
                tracing::debug!("Reaper stopping: dispatcher gone");
                return;
            }
            relay.rate_limits().shrink();
        }
    })
}
