//! Pool state manager
//!
//! Reads the three authoritative structures of a pool (available list, leased
//! list, cooldown set) and derives the consistent state they should describe.
//! The two index sets are never read here: they are rebuilt from scratch.
//!
//! Rebuild rules:
//! - A username is kept once. Structures are visited leased, then cooldown,
//!   then available, so an account that is out on lease or quarantined is
//!   never resurrected as available.
//! - Every kept record is relabeled with the state implied by the structure it
//!   was found in; the flags stored inside the record are not trusted.
//! - Cooldown records take their ready-at time from the sorted-set score.
//! - Entries that do not decode are dropped.

use std::collections::HashMap;

use serde::Serialize;

use crate::account::{Account, LeaseState};
use crate::codec;
use crate::error::Result;
use crate::keys::PoolKeys;
use crate::store::{Guard, Patch, Store};

/// Per-structure record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub available: usize,
    pub in_use: usize,
    pub cooldown: usize,
    pub total: usize,
}

impl PoolCounts {
    pub fn new(available: usize, in_use: usize, cooldown: usize) -> Self {
        Self {
            available,
            in_use,
            cooldown,
            total: available + in_use + cooldown,
        }
    }

    /// Raw lengths straight from the store, duplicates and all.
    pub async fn read<S: Store>(store: &S, keys: &PoolKeys) -> Result<Self> {
        let available = store.llen(&keys.available).await?;
        let in_use = store.llen(&keys.leased).await?;
        let cooldown = store.zcard(&keys.cooldown).await?;
        Ok(Self::new(available, in_use, cooldown))
    }
}

/// One of the three authoritative structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Structure {
    Available,
    Leased,
    Cooldown,
}

impl Structure {
    pub fn key<'k>(&self, keys: &'k PoolKeys) -> &'k str {
        match self {
            Structure::Available => &keys.available,
            Structure::Leased => &keys.leased,
            Structure::Cooldown => &keys.cooldown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Structure::Available => "available",
            Structure::Leased => "in_use",
            Structure::Cooldown => "cooldown",
        }
    }
}

/// A username found in more than one structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub username: String,
    pub kept: Structure,
    pub dropped: Structure,
}

/// Raw contents of the authoritative structures at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolSnapshot {
    pub available: Vec<String>,
    pub leased: Vec<String>,
    /// (payload, ready-at), ascending by ready-at.
    pub cooldown: Vec<(String, f64)>,
}

impl PoolSnapshot {
    pub async fn read<S: Store>(store: &S, keys: &PoolKeys) -> Result<Self> {
        let available = store.lrange(&keys.available).await?;
        let leased = store.lrange(&keys.leased).await?;
        let cooldown = store.zrange_with_scores(&keys.cooldown).await?;
        Ok(Self {
            available,
            leased,
            cooldown,
        })
    }

    /// Number of raw entries across all three structures.
    pub fn total(&self) -> usize {
        self.available.len() + self.leased.len() + self.cooldown.len()
    }

    /// Derive the deduplicated, relabeled pool this snapshot should describe.
    ///
    /// Leased records that carry no `acquired_at` are stamped with `now`.
    pub fn rebuild(&self, keys: &PoolKeys, now: f64) -> Rebuild {
        let mut rebuild = Rebuild::default();
        let mut seen: HashMap<String, Structure> = HashMap::new();

        for payload in &self.leased {
            let Some(account) = codec::decode_or_skip(payload, &keys.leased) else {
                rebuild.malformed += 1;
                continue;
            };
            if rebuild.claim(&mut seen, account.username(), Structure::Leased) {
                let acquired_at = account.acquired_at().or(Some(now));
                rebuild
                    .leased
                    .push(account.relabeled(LeaseState::Leased { acquired_at }));
            }
        }

        for (payload, ready_at) in &self.cooldown {
            let Some(account) = codec::decode_or_skip(payload, &keys.cooldown) else {
                rebuild.malformed += 1;
                continue;
            };
            if rebuild.claim(&mut seen, account.username(), Structure::Cooldown) {
                rebuild
                    .cooldown
                    .push(account.relabeled(LeaseState::CoolingDown { until: *ready_at }));
            }
        }

        for payload in &self.available {
            let Some(account) = codec::decode_or_skip(payload, &keys.available) else {
                rebuild.malformed += 1;
                continue;
            };
            if rebuild.claim(&mut seen, account.username(), Structure::Available) {
                rebuild.available.push(account.relabeled(LeaseState::Available));
            }
        }

        rebuild
    }
}

/// The consistent pool derived from a snapshot.
#[derive(Debug, Clone, Default)]
pub struct Rebuild {
    pub available: Vec<Account>,
    pub leased: Vec<Account>,
    /// Ascending by ready-at.
    pub cooldown: Vec<Account>,
    /// Cross-structure duplicates; each one breaks the one-place-per-username rule.
    pub violations: Vec<Violation>,
    /// Repeats of a username within the structure it was kept in.
    pub duplicates: usize,
    pub malformed: usize,
}

impl Rebuild {
    /// Record `username` as living in `structure`. Returns false if it was
    /// already claimed.
    fn claim(
        &mut self,
        seen: &mut HashMap<String, Structure>,
        username: &str,
        structure: Structure,
    ) -> bool {
        match seen.get(username) {
            None => {
                seen.insert(username.to_string(), structure);
                true
            }
            Some(&kept) if kept == structure => {
                self.duplicates += 1;
                false
            }
            Some(&kept) => {
                self.violations.push(Violation {
                    username: username.to_string(),
                    kept,
                    dropped: structure,
                });
                false
            }
        }
    }

    pub fn counts(&self) -> PoolCounts {
        PoolCounts::new(self.available.len(), self.leased.len(), self.cooldown.len())
    }

    /// Compare-and-swap patch replacing all five structures with this rebuild.
    ///
    /// Guarded on the authoritative structures still matching `snapshot`.
    pub fn patch(&self, keys: &PoolKeys, snapshot: &PoolSnapshot) -> Result<Patch> {
        let available = encode_all(&self.available)?;
        let leased = encode_all(&self.leased)?;
        let mut cooldown = Vec::with_capacity(self.cooldown.len());
        for account in &self.cooldown {
            let ready_at = account.cooldown_until().unwrap_or_default();
            cooldown.push((codec::encode(account)?, ready_at));
        }

        let mut patch = Patch::new();
        patch
            .guard(Guard::ListEquals {
                key: keys.available.clone(),
                items: snapshot.available.clone(),
            })
            .guard(Guard::ListEquals {
                key: keys.leased.clone(),
                items: snapshot.leased.clone(),
            })
            .guard(Guard::ZSetEquals {
                key: keys.cooldown.clone(),
                entries: snapshot.cooldown.clone(),
            });
        for key in keys.all() {
            patch.delete(key);
        }
        patch
            .rpush(&keys.available, available)
            .sadd(&keys.available_index, usernames(&self.available))
            .rpush(&keys.leased, leased)
            .sadd(&keys.leased_index, usernames(&self.leased))
            .zadd(&keys.cooldown, cooldown);
        Ok(patch)
    }

    /// Every kept account: available, then leased, then cooldown.
    pub fn into_accounts(self) -> Vec<Account> {
        let mut accounts = self.available;
        accounts.extend(self.leased);
        accounts.extend(self.cooldown);
        accounts
    }
}

fn encode_all(accounts: &[Account]) -> Result<Vec<String>> {
    accounts.iter().map(codec::encode).collect()
}

fn usernames(accounts: &[Account]) -> Vec<String> {
    accounts.iter().map(|a| a.username().to_string()).collect()
}
