//! Periodic pool maintenance
//!
//! Spawns a background task that reclaims leases held past the lease timeout
//! and runs a status pass, which repairs index drift and reaps expired
//! cooldowns as a side effect. Keeps an idle pool tidy even when no caller is
//! acquiring or releasing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pool::LeaseCoordinator;
use crate::store::Store;

/// Spawn the maintenance loop for `pool`.
///
/// Runs every `interval`. Failures are logged and the next cycle tries again.
pub fn spawn_maintenance_task<S: Store>(
    coordinator: Arc<LeaseCoordinator<S>>,
    pool: String,
    interval: Duration,
    lease_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; startup already touched the store.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            maintenance_cycle(&coordinator, &pool, lease_timeout).await;
        }
    })
}

/// One maintenance pass over `pool`.
async fn maintenance_cycle<S: Store>(
    coordinator: &LeaseCoordinator<S>,
    pool: &str,
    lease_timeout: Duration,
) {
    match coordinator.cleanup_expired(pool, lease_timeout).await {
        Ok(0) => {}
        Ok(cleaned) => info!(pool, cleaned, "maintenance reclaimed expired leases"),
        Err(e) => warn!(pool, error = %e, "lease cleanup failed, will retry next cycle"),
    }

    match coordinator.status(pool).await {
        Ok(counts) => debug!(
            pool,
            available = counts.available,
            in_use = counts.in_use,
            cooldown = counts.cooldown,
            "maintenance pass complete"
        ),
        Err(e) => warn!(pool, error = %e, "pool status check failed, will retry next cycle"),
    }
}
