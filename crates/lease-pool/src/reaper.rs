//! Cooldown reaper
//!
//! Promotes cooldown entries whose ready-at time has passed back onto the tail
//! of the available list. The promotion is computed client-side from a read of
//! the due entries and committed as a guarded patch, so two reapers racing on
//! the same pool cannot both promote the same entry: the loser's guard on the
//! due set fails and it starts over from a fresh read.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::codec;
use crate::error::Result;
use crate::keys::PoolKeys;
use crate::metrics;
use crate::store::{Guard, Patch, Store};

/// Move every due cooldown entry to the available list.
///
/// Unreadable entries are removed from the cooldown set without being
/// promoted, as are repeats of a username already promoted in the same pass.
/// Returns the number of accounts made available.
pub async fn reap_expired<S: Store>(store: &S, keys: &PoolKeys, clock: &dyn Clock) -> Result<usize> {
    loop {
        let now = clock.now();
        let due: Vec<String> = store
            .zrange_with_scores(&keys.cooldown)
            .await?
            .into_iter()
            .filter(|(_, ready_at)| *ready_at <= now)
            .map(|(member, _)| member)
            .collect();
        if due.is_empty() {
            return Ok(0);
        }

        let available_len = store.llen(&keys.available).await?;
        let index_card = store.scard(&keys.available_index).await?;

        let mut seen = HashSet::new();
        let mut payloads = Vec::with_capacity(due.len());
        let mut usernames = Vec::with_capacity(due.len());
        for member in &due {
            let Some(account) = codec::decode_or_skip(member, &keys.cooldown) else {
                continue;
            };
            if !seen.insert(account.username().to_string()) {
                continue;
            }
            let account = account.cooled_down();
            payloads.push(codec::encode(&account)?);
            usernames.push(account.username().to_string());
        }

        let mut patch = Patch::new();
        patch
            .guard(Guard::ZSetDueEquals {
                key: keys.cooldown.clone(),
                max_score: now,
                members: due.clone(),
            })
            .guard(Guard::LenEquals {
                key: keys.available.clone(),
                len: available_len,
            })
            .guard(Guard::CardEquals {
                key: keys.available_index.clone(),
                card: index_card,
            })
            .zrem(&keys.cooldown, due)
            .rpush(&keys.available, payloads)
            .sadd(&keys.available_index, usernames.clone());

        if !store.commit(&patch).await? {
            debug!(pool = keys.pool(), "cooldown set changed during reap, retrying");
            tokio::task::yield_now().await;
            continue;
        }

        let promoted = usernames.len();
        if promoted > 0 {
            metrics::record_reaped(promoted);
            info!(pool = keys.pool(), count = promoted, usernames = ?usernames, "cooldown expired, accounts available again");
        }
        return Ok(promoted);
    }
}
