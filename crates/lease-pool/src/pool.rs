//! Lease coordinator
//!
//! Public operations over a named pool. The coordinator keeps no pool state in
//! memory: every call re-reads the store, because any number of other
//! processes may be mutating the same pool.
//!
//! Before doing its own work each operation (except `save` and
//! `remove_duplicates`, which rewrite the pool themselves) runs two
//! housekeeping passes: an index drift check that rebuilds the pool when the
//! index sets disagree with their lists, then the cooldown reaper so that
//! just-expired accounts are eligible.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountSeed};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::error::Result;
use crate::keys::PoolKeys;
use crate::metrics;
use crate::reaper;
use crate::repair;
use crate::state::{PoolCounts, PoolSnapshot};
use crate::store::{Patch, Store};

/// Cooldown applied to leases reclaimed by `cleanup_expired`.
pub const DEFAULT_ABANDONED_COOLDOWN_SECS: u64 = 30;

/// Unreadable entries `acquire` will discard before giving up.
const MAX_DECODE_ATTEMPTS: u32 = 100;

/// Outcome of `remove_duplicates`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub removed: usize,
    pub available: usize,
    pub in_use: usize,
    pub cooldown: usize,
}

/// Coordinates leases over pools held in a shared store.
pub struct LeaseCoordinator<S> {
    store: S,
    clock: Arc<dyn Clock>,
    abandoned_cooldown_secs: u64,
}

impl<S: Store> LeaseCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            abandoned_cooldown_secs: DEFAULT_ABANDONED_COOLDOWN_SECS,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_abandoned_cooldown(mut self, secs: u64) -> Self {
        self.abandoned_cooldown_secs = secs;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// True if the store answers.
    pub async fn test_connection(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store connection test failed");
                false
            }
        }
    }

    async fn prepare(&self, keys: &PoolKeys) -> Result<()> {
        repair::ensure_indexes(&self.store, keys, self.clock.as_ref()).await?;
        reaper::reap_expired(&self.store, keys, self.clock.as_ref()).await?;
        Ok(())
    }

    /// Replace the whole pool with `seeds`, all available.
    ///
    /// Rows with a blank username or password are dropped, as are repeats of a
    /// username already seen earlier in `seeds`.
    pub async fn save(&self, pool: &str, seeds: &[AccountSeed]) -> Result<bool> {
        let keys = PoolKeys::new(pool);
        let now = self.clock.now();

        let mut seen = HashSet::new();
        let mut payloads = Vec::with_capacity(seeds.len());
        let mut usernames = Vec::with_capacity(seeds.len());
        for (row, seed) in seeds.iter().enumerate() {
            let username = seed.username.trim();
            if username.is_empty() || seed.password.is_blank() {
                warn!(pool, row, "dropping account without username or password");
                continue;
            }
            if !seen.insert(username.to_string()) {
                warn!(pool, row, username, "dropping duplicate account");
                continue;
            }
            let account = Account::new(username, seed.password.clone(), now);
            payloads.push(codec::encode(&account)?);
            usernames.push(username.to_string());
        }

        let stored = payloads.len();
        let mut patch = Patch::new();
        for key in keys.all() {
            patch.delete(key);
        }
        patch
            .rpush(&keys.available, payloads)
            .sadd(&keys.available_index, usernames);

        let applied = self.store.commit(&patch).await?;
        info!(
            pool,
            stored,
            dropped = seeds.len() - stored,
            "pool saved"
        );
        Ok(applied)
    }

    /// Lease the account at the head of the available list.
    ///
    /// `Ok(None)` when nothing is available.
    pub async fn acquire(&self, pool: &str) -> Result<Option<Account>> {
        let keys = PoolKeys::new(pool);
        self.prepare(&keys).await?;

        let mut remaining = MAX_DECODE_ATTEMPTS;
        while remaining > 0 {
            let now = self.clock.now();
            let Some(payload) = self.store.acquire(&keys, now, remaining).await? else {
                break;
            };
            match codec::decode(&payload) {
                Ok(account) => {
                    metrics::record_acquire("leased");
                    info!(pool, username = account.username(), "account leased");
                    return Ok(Some(account));
                }
                Err(e) => {
                    warn!(pool, error = %e, "leased entry could not be read, trying next");
                    remaining -= 1;
                }
            }
        }

        metrics::record_acquire("empty");
        debug!(pool, "no account available");
        Ok(None)
    }

    /// Return a leased account, optionally into cooldown.
    ///
    /// `Ok(false)` when the account is not currently leased.
    pub async fn release(&self, pool: &str, account: &Account, cooldown_secs: u64) -> Result<bool> {
        self.release_username(pool, account.username(), cooldown_secs)
            .await
    }

    /// `release` by username alone.
    pub async fn release_username(
        &self,
        pool: &str,
        username: &str,
        cooldown_secs: u64,
    ) -> Result<bool> {
        if username.is_empty() {
            warn!(pool, "release called without a username");
            return Ok(false);
        }
        let keys = PoolKeys::new(pool);
        self.prepare(&keys).await?;
        self.release_leased(&keys, username, None, cooldown_secs)
            .await
    }

    /// Release through the store. With `expected` set, only that exact leased
    /// record is released; a newer lease of the same account is left alone.
    async fn release_leased(
        &self,
        keys: &PoolKeys,
        username: &str,
        expected: Option<&str>,
        cooldown_secs: u64,
    ) -> Result<bool> {
        let released = self
            .store
            .release(keys, username, expected, cooldown_secs, self.clock.now())
            .await?;

        let pool = keys.pool();
        match (released, cooldown_secs) {
            (false, _) => {
                metrics::record_release("not_leased");
                debug!(pool, username, "release ignored, account not leased");
            }
            (true, 0) => {
                metrics::record_release("available");
                info!(pool, username, "account released");
            }
            (true, cooldown_secs) => {
                metrics::record_release("cooldown");
                info!(pool, username, cooldown_secs, "account released into cooldown");
            }
        }
        Ok(released)
    }

    /// Record counts per structure.
    pub async fn status(&self, pool: &str) -> Result<PoolCounts> {
        let keys = PoolKeys::new(pool);
        self.prepare(&keys).await?;
        PoolCounts::read(&self.store, &keys).await
    }

    /// Every account in the pool: available, then leased, then cooling down.
    ///
    /// Each account's state reflects the structure it lives in. Repeats and
    /// unreadable entries are left out.
    pub async fn list_all(&self, pool: &str) -> Result<Vec<Account>> {
        let keys = PoolKeys::new(pool);
        self.prepare(&keys).await?;
        let snapshot = PoolSnapshot::read(&self.store, &keys).await?;
        Ok(snapshot.rebuild(&keys, self.clock.now()).into_accounts())
    }

    /// Reclaim leases held for at least `timeout`, putting them into the
    /// abandoned-lease cooldown. Returns how many were reclaimed.
    ///
    /// Leases with no recorded `acquired_at` never expire. A lease that was
    /// returned and taken again after it was judged expired is not reclaimed.
    pub async fn cleanup_expired(&self, pool: &str, timeout: Duration) -> Result<usize> {
        let keys = PoolKeys::new(pool);
        self.prepare(&keys).await?;

        let now = self.clock.now();
        let limit = timeout.as_secs_f64();
        let mut seen = HashSet::new();
        let mut expired = Vec::new();
        for payload in self.store.lrange(&keys.leased).await? {
            let Some(account) = codec::decode_or_skip(&payload, &keys.leased) else {
                continue;
            };
            let Some(acquired_at) = account.acquired_at() else {
                continue;
            };
            if now - acquired_at >= limit && seen.insert(account.username().to_string()) {
                expired.push((account, payload));
            }
        }

        let mut cleaned = 0;
        for (account, payload) in &expired {
            if self
                .release_leased(
                    &keys,
                    account.username(),
                    Some(payload.as_str()),
                    self.abandoned_cooldown_secs,
                )
                .await?
            {
                cleaned += 1;
                info!(
                    pool,
                    username = account.username(),
                    held_secs = now - account.acquired_at().unwrap_or(now),
                    "reclaimed expired lease"
                );
            }
        }
        if cleaned > 0 {
            metrics::record_expired(cleaned);
        }
        Ok(cleaned)
    }

    /// Return every leased account straight to available. Returns the count.
    pub async fn release_all(&self, pool: &str) -> Result<usize> {
        let keys = PoolKeys::new(pool);
        self.prepare(&keys).await?;

        let mut seen = HashSet::new();
        let mut released = 0;
        for payload in self.store.lrange(&keys.leased).await? {
            let Some(account) = codec::decode_or_skip(&payload, &keys.leased) else {
                continue;
            };
            if !seen.insert(account.username().to_string()) {
                continue;
            }
            if self
                .release_leased(&keys, account.username(), None, 0)
                .await?
            {
                released += 1;
            }
        }
        info!(pool, released, "released all leased accounts");
        Ok(released)
    }

    /// Force a rebuild and report how many records it removed.
    pub async fn remove_duplicates(&self, pool: &str) -> Result<DedupReport> {
        let keys = PoolKeys::new(pool);
        let before = PoolCounts::read(&self.store, &keys).await?;
        let after = repair::normalize(&self.store, &keys, self.clock.as_ref()).await?;
        let report = DedupReport {
            removed: before.total.saturating_sub(after.total),
            available: after.available,
            in_use: after.in_use,
            cooldown: after.cooldown,
        };
        info!(pool, removed = report.removed, "duplicate removal finished");
        Ok(report)
    }

    /// Promote due cooldown entries now. Returns the count.
    pub async fn reap_expired(&self, pool: &str) -> Result<usize> {
        let keys = PoolKeys::new(pool);
        reaper::reap_expired(&self.store, &keys, self.clock.as_ref()).await
    }

    /// Rebuild the pool unconditionally.
    pub async fn normalize(&self, pool: &str) -> Result<PoolCounts> {
        let keys = PoolKeys::new(pool);
        repair::normalize(&self.store, &keys, self.clock.as_ref()).await
    }

    /// Rebuild the pool if its indexes have drifted. Returns whether it did.
    pub async fn ensure_indexes(&self, pool: &str) -> Result<bool> {
        let keys = PoolKeys::new(pool);
        repair::ensure_indexes(&self.store, &keys, self.clock.as_ref()).await
    }
}
