//! Pool counters
//!
//! Emitted through the `metrics` facade; they are no-ops until the embedding
//! binary installs a recorder.
//!
//! - `lease_pool_acquire_total` (counter): label `outcome` = `leased` | `empty`
//! - `lease_pool_release_total` (counter): label `outcome` = `available` | `cooldown` | `not_leased`
//! - `lease_pool_reaped_total` (counter): cooldown entries promoted to available
//! - `lease_pool_repairs_total` (counter): completed rebuilds
//! - `lease_pool_expired_leases_total` (counter): leases reclaimed by cleanup

pub(crate) fn record_acquire(outcome: &'static str) {
    metrics::counter!("lease_pool_acquire_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_release(outcome: &'static str) {
    metrics::counter!("lease_pool_release_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_reaped(count: usize) {
    metrics::counter!("lease_pool_reaped_total").increment(count as u64);
}

pub(crate) fn record_repair() {
    metrics::counter!("lease_pool_repairs_total").increment(1);
}

pub(crate) fn record_expired(count: usize) {
    metrics::counter!("lease_pool_expired_leases_total").increment(count as u64);
}
