//! Shared key-value store adapter
//!
//! The pool keeps no state of its own between calls: every operation reads the
//! store, decides, and writes back through one of two atomic paths.
//!
//! - Scripted transitions (`acquire`, `release`) run as a single indivisible
//!   unit inside the store.
//! - Guarded patches (`commit`) are compare-and-swap batches: the caller reads a
//!   snapshot, computes the full next state, and submits it together with the
//!   facts it relied on. If any fact no longer holds nothing is applied and the
//!   caller starts over from a fresh read.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::keys::PoolKeys;

pub use memory::MemoryStore;
pub use redis::{RedisSettings, RedisStore};

/// A fact about the store that must still hold when a patch is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// List contents are exactly `items`, in order.
    ListEquals { key: String, items: Vec<String> },
    /// Sorted-set contents are exactly `entries` (member, score), in rank order.
    ZSetEquals {
        key: String,
        entries: Vec<(String, f64)>,
    },
    /// Members scored at or below `max_score` are exactly `members`, in rank order.
    ZSetDueEquals {
        key: String,
        max_score: f64,
        members: Vec<String>,
    },
    /// List length.
    LenEquals { key: String, len: usize },
    /// Set cardinality.
    CardEquals { key: String, card: usize },
}

/// A single mutation inside a patch.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Delete { key: String },
    RPush { key: String, items: Vec<String> },
    SAdd { key: String, members: Vec<String> },
    ZAdd {
        key: String,
        entries: Vec<(String, f64)>,
    },
    ZRem { key: String, members: Vec<String> },
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Op::Delete { key }
            | Op::RPush { key, .. }
            | Op::SAdd { key, .. }
            | Op::ZAdd { key, .. }
            | Op::ZRem { key, .. } => key,
        }
    }
}

impl Guard {
    pub fn key(&self) -> &str {
        match self {
            Guard::ListEquals { key, .. }
            | Guard::ZSetEquals { key, .. }
            | Guard::ZSetDueEquals { key, .. }
            | Guard::LenEquals { key, .. }
            | Guard::CardEquals { key, .. } => key,
        }
    }
}

/// Guarded batch of mutations, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    guards: Vec<Guard>,
    ops: Vec<Op>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn guard(&mut self, guard: Guard) -> &mut Self {
        self.guards.push(guard);
        self
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.ops.push(Op::Delete {
            key: key.to_string(),
        });
        self
    }

    /// Empty pushes are dropped; stores reject pushes without values.
    pub fn rpush(&mut self, key: &str, items: Vec<String>) -> &mut Self {
        if !items.is_empty() {
            self.ops.push(Op::RPush {
                key: key.to_string(),
                items,
            });
        }
        self
    }

    pub fn sadd(&mut self, key: &str, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(Op::SAdd {
                key: key.to_string(),
                members,
            });
        }
        self
    }

    pub fn zadd(&mut self, key: &str, entries: Vec<(String, f64)>) -> &mut Self {
        if !entries.is_empty() {
            self.ops.push(Op::ZAdd {
                key: key.to_string(),
                entries,
            });
        }
        self
    }

    pub fn zrem(&mut self, key: &str, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(Op::ZRem {
                key: key.to_string(),
                members,
            });
        }
        self
    }

    /// Every distinct key the patch touches or checks, in first-seen order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let touched = self
            .guards
            .iter()
            .map(Guard::key)
            .chain(self.ops.iter().map(Op::key));
        for key in touched {
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        }
        keys
    }
}

/// Connection to the shared store.
///
/// Implementations must give `acquire`, `release` and `commit` all-or-nothing
/// semantics with respect to every other caller of the same store, in this or
/// any other process.
pub trait Store: Send + Sync + 'static {
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    fn lrange(&self, key: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn llen(&self, key: &str) -> impl Future<Output = Result<usize>> + Send;

    fn scard(&self, key: &str) -> impl Future<Output = Result<usize>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    fn zcard(&self, key: &str) -> impl Future<Output = Result<usize>> + Send;

    /// All members with scores, ascending by score then member.
    fn zrange_with_scores(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Vec<(String, f64)>>> + Send;

    /// Apply `patch` if all its guards hold. Returns `false` on conflict.
    fn commit(&self, patch: &Patch) -> impl Future<Output = Result<bool>> + Send;

    /// Pop the head of the available list, skipping up to `max_attempts`
    /// unreadable entries, and move it to the leased list marked in use.
    /// Returns the rewritten record, or `None` when nothing could be leased.
    fn acquire(
        &self,
        keys: &PoolKeys,
        now: f64,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Move the leased record for `username` back to the available list, or into
    /// cooldown when `cooldown_secs > 0`. Returns `false` if it was not leased.
    ///
    /// With `expected` set, only a leased entry byte-equal to that payload
    /// matches, so a lease observed earlier is never confused with a newer
    /// lease of the same account.
    fn release(
        &self,
        keys: &PoolKeys,
        username: &str,
        expected: Option<&str>,
        cooldown_secs: u64,
        now: f64,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// Several coordinators (standing in for separate processes) can share one
/// store handle.
impl<S: Store> Store for Arc<S> {
    fn ping(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).ping()
    }

    fn lrange(&self, key: &str) -> impl Future<Output = Result<Vec<String>>> + Send {
        (**self).lrange(key)
    }

    fn llen(&self, key: &str) -> impl Future<Output = Result<usize>> + Send {
        (**self).llen(key)
    }

    fn scard(&self, key: &str) -> impl Future<Output = Result<usize>> + Send {
        (**self).scard(key)
    }

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        (**self).exists(key)
    }

    fn zcard(&self, key: &str) -> impl Future<Output = Result<usize>> + Send {
        (**self).zcard(key)
    }

    fn zrange_with_scores(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Vec<(String, f64)>>> + Send {
        (**self).zrange_with_scores(key)
    }

    fn commit(&self, patch: &Patch) -> impl Future<Output = Result<bool>> + Send {
        (**self).commit(patch)
    }

    fn acquire(
        &self,
        keys: &PoolKeys,
        now: f64,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Option<String>>> + Send {
        (**self).acquire(keys, now, max_attempts)
    }

    fn release(
        &self,
        keys: &PoolKeys,
        username: &str,
        expected: Option<&str>,
        cooldown_secs: u64,
        now: f64,
    ) -> impl Future<Output = Result<bool>> + Send {
        (**self).release(keys, username, expected, cooldown_secs, now)
    }
}
