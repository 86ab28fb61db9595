//! Background cleanup of abandoned sign-in requests.
//!
//! A sign-in that never comes back (closed tab, dismissed popup, timed-out
//! renewal frame) leaves its request in the store; this task evicts them.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::SessionStore;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Spawn a background task that periodically evicts stale sign-in requests.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<SessionStore>,
    cleanup_interval_secs: u64,
    max_age: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match store.evict_stale_requests(max_age) {
                Ok(count) if count > 0 => {
                    info!(evicted = count, "Evicted stale sign-in requests");
                }
                Ok(_) => {
                    debug!(
                        pending_requests = store.pending_requests(),
                        "Sign-in request cleanup: nothing stale"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Sign-in request cleanup failed");
                }
            }
        }
    })
}
