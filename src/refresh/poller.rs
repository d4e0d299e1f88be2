//! Periodic refresh — keeps the cached usage view fresh.
//!
//! The startup refresh runs eagerly in `main`; this loop owns every
//! tick after it. A slow tick pushes the next one back instead of
//! bunching ticks up.

use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::debug;

use super::Refresher;

/// Run the refresh poller in the background.
pub async fn run_poller(refresher: Arc<Refresher>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip the immediate tick (startup refresh already ran)

    loop {
        ticker.tick().await;
        let snapshots = refresher.refresh_all().await;
        let authenticated = snapshots.iter().filter(|s| s.authenticated).count();
        debug!(
            providers = snapshots.len(),
            authenticated = authenticated,
            "Refresh tick complete"
        );
    }
}
