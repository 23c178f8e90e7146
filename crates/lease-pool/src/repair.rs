//! Index drift detection and pool rebuild
//!
//! The index sets mirror list membership so drift can be spotted with two
//! cardinality reads. When they disagree with their lists the whole pool is
//! rebuilt from the authoritative structures in one guarded batch.

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::keys::PoolKeys;
use crate::metrics;
use crate::state::{PoolCounts, PoolSnapshot};
use crate::store::Store;

/// Rebuild the pool if either index has drifted from its list.
///
/// A list that is empty never triggers a rebuild, whatever its index holds.
/// Returns whether a rebuild ran.
pub async fn ensure_indexes<S: Store>(store: &S, keys: &PoolKeys, clock: &dyn Clock) -> Result<bool> {
    let available_len = store.llen(&keys.available).await?;
    let leased_len = store.llen(&keys.leased).await?;

    let mut drifted = false;
    for (list_len, index) in [
        (available_len, &keys.available_index),
        (leased_len, &keys.leased_index),
    ] {
        if list_len == 0 {
            continue;
        }
        if !store.exists(index).await? {
            info!(pool = keys.pool(), index = %index, list_len, "index missing");
            drifted = true;
            break;
        }
        let card = store.scard(index).await?;
        if card != list_len {
            info!(pool = keys.pool(), index = %index, list_len, card, "index drift detected");
            drifted = true;
            break;
        }
    }

    if drifted {
        normalize(store, keys, clock).await?;
    }
    Ok(drifted)
}

/// Rebuild all five structures from the authoritative ones.
///
/// Retries from a fresh read until the rebuild commits without interference.
/// Idempotent: a second run with no writes in between produces the same state.
pub async fn normalize<S: Store>(store: &S, keys: &PoolKeys, clock: &dyn Clock) -> Result<PoolCounts> {
    loop {
        let snapshot = PoolSnapshot::read(store, keys).await?;
        let rebuild = snapshot.rebuild(keys, clock.now());
        let patch = rebuild.patch(keys, &snapshot)?;

        if !store.commit(&patch).await? {
            debug!(pool = keys.pool(), "pool changed during rebuild, retrying");
            tokio::task::yield_now().await;
            continue;
        }

        for violation in &rebuild.violations {
            warn!(
                pool = keys.pool(),
                username = %violation.username,
                kept = violation.kept.label(),
                dropped = violation.dropped.label(),
                "account found in more than one structure"
            );
        }

        let counts = rebuild.counts();
        metrics::record_repair();
        info!(
            pool = keys.pool(),
            available = counts.available,
            in_use = counts.in_use,
            cooldown = counts.cooldown,
            duplicates = rebuild.duplicates,
            malformed = rebuild.malformed,
            removed = snapshot.total().saturating_sub(counts.total),
            "pool normalized"
        );
        return Ok(counts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::clock::ManualClock;
    use crate::codec;
    use crate::store::{MemoryStore, Store};
    use common::Secret;

    fn record(name: &str) -> String {
        codec::encode(&Account::new(name, Secret::from("pw"), 1.0)).unwrap()
    }

    #[tokio::test]
    async fn consistent_pool_is_left_alone() {
        let store = MemoryStore::new();
        let keys = PoolKeys::new("p");
        let clock = ManualClock::new(10.0);
        store.push_raw(&keys.available, &record("a")).await.unwrap();
        // push_raw bypasses the index; build it with a normalize first.
        normalize(&store, &keys, &clock).await.unwrap();

        assert!(!ensure_indexes(&store, &keys, &clock).await.unwrap());
    }

    #[tokio::test]
    async fn missing_index_triggers_rebuild() {
        let store = MemoryStore::new();
        let keys = PoolKeys::new("p");
        let clock = ManualClock::new(10.0);
        store.push_raw(&keys.available, &record("a")).await.unwrap();
        store.push_raw(&keys.available, &record("b")).await.unwrap();

        assert!(ensure_indexes(&store, &keys, &clock).await.unwrap());
        assert_eq!(
            store.smembers(&keys.available_index).await.unwrap(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn stale_leased_index_is_rebuilt() {
        let store = MemoryStore::new();
        let keys = PoolKeys::new("p");
        let clock = ManualClock::new(10.0);
        let leased = codec::encode(&Account::new("u", Secret::from("pw"), 1.0).leased(5.0)).unwrap();
        store.push_raw(&keys.leased, &leased).await.unwrap();
        normalize(&store, &keys, &clock).await.unwrap();
        store.srem_raw(&keys.leased_index, "u").await.unwrap();
        assert!(!store.exists(&keys.leased_index).await.unwrap());

        assert!(ensure_indexes(&store, &keys, &clock).await.unwrap());
        assert_eq!(store.smembers(&keys.leased_index).await.unwrap(), vec!["u"]);
    }

    #[tokio::test]
    async fn normalize_twice_is_stable() {
        let store = MemoryStore::new();
        let keys = PoolKeys::new("p");
        let clock = ManualClock::new(10.0);
        for name in ["a", "b", "a", "c"] {
            store.push_raw(&keys.available, &record(name)).await.unwrap();
        }
        store.push_raw(&keys.available, "{not json").await.unwrap();

        let first = normalize(&store, &keys, &clock).await.unwrap();
        let after_first = store.lrange(&keys.available).await.unwrap();
        let second = normalize(&store, &keys, &clock).await.unwrap();
        let after_second = store.lrange(&keys.available).await.unwrap();

        assert_eq!(first, PoolCounts::new(3, 0, 0));
        assert_eq!(first, second);
        assert_eq!(after_first, after_second);
    }
}
