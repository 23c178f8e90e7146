//! In-process store backend
//!
//! Mirrors the Redis data-structure semantics the pool relies on: a key holds
//! exactly one type, empty collections disappear, sorted sets rank by score and
//! then by member. Every operation, including the scripted lease transitions,
//! runs under one lock, so it is atomic with respect to every other caller
//! sharing the same `MemoryStore`.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::warn;

use crate::codec;
use crate::error::{Error, Result};
use crate::keys::PoolKeys;
use crate::store::{Guard, Op, Patch, Store};

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::List(items) => items.is_empty(),
            Value::Set(members) => members.is_empty(),
            Value::ZSet(entries) => entries.is_empty(),
        }
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Store(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

#[derive(Debug, Default)]
struct Keyspace {
    values: HashMap<String, Value>,
}

impl Keyspace {
    fn list(&self, key: &str) -> Result<Option<&VecDeque<String>>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::List(items)) => Ok(Some(items)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set(&self, key: &str) -> Result<Option<&BTreeSet<String>>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Set(members)) => Ok(Some(members)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zset(&self, key: &str) -> Result<Option<&HashMap<String, f64>>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::ZSet(entries)) => Ok(Some(entries)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(items) => Ok(items),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<String>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(BTreeSet::new()))
        {
            Value::Set(members) => Ok(members),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset_mut(&mut self, key: &str) -> Result<&mut HashMap<String, f64>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::ZSet(HashMap::new()))
        {
            Value::ZSet(entries) => Ok(entries),
            _ => Err(wrong_type(key)),
        }
    }

    /// Drop `key` if it holds an empty collection.
    fn prune(&mut self, key: &str) {
        if self.values.get(key).is_some_and(Value::is_empty) {
            self.values.remove(key);
        }
    }

    fn prune_all(&mut self) {
        self.values.retain(|_, value| !value.is_empty());
    }

    /// Reject a lease transition up front if any pool key holds the wrong
    /// type, so nothing is popped or removed before the error.
    fn check_lease_keys(&self, keys: &PoolKeys) -> Result<()> {
        self.list(&keys.available)?;
        self.list(&keys.leased)?;
        self.set(&keys.available_index)?;
        self.set(&keys.leased_index)?;
        self.zset(&keys.cooldown)?;
        Ok(())
    }

    fn lrange(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .list(key)?
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.list(key)?.map_or(0, VecDeque::len))
    }

    fn scard(&self, key: &str) -> Result<usize> {
        Ok(self.set(key)?.map_or(0, BTreeSet::len))
    }

    fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut entries: Vec<(String, f64)> = self
            .zset(key)?
            .map(|entries| entries.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    fn check(&self, guard: &Guard) -> Result<bool> {
        Ok(match guard {
            Guard::ListEquals { key, items } => self.lrange(key)? == *items,
            Guard::ZSetEquals { key, entries } => self.zrange(key)? == *entries,
            Guard::ZSetDueEquals {
                key,
                max_score,
                members,
            } => {
                let due: Vec<String> = self
                    .zrange(key)?
                    .into_iter()
                    .filter(|(_, score)| score <= max_score)
                    .map(|(member, _)| member)
                    .collect();
                due == *members
            }
            Guard::LenEquals { key, len } => self.llen(key)? == *len,
            Guard::CardEquals { key, card } => self.scard(key)? == *card,
        })
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Delete { key } => {
                self.values.remove(key);
            }
            Op::RPush { key, items } => self.list_mut(key)?.extend(items.iter().cloned()),
            Op::SAdd { key, members } => self.set_mut(key)?.extend(members.iter().cloned()),
            Op::ZAdd { key, entries } => {
                let zset = self.zset_mut(key)?;
                for (member, score) in entries {
                    zset.insert(member.clone(), *score);
                }
            }
            Op::ZRem { key, members } => {
                if self.zset(key)?.is_some() {
                    let zset = self.zset_mut(key)?;
                    for member in members {
                        zset.remove(member);
                    }
                }
            }
        }
        self.prune(op.key());
        Ok(())
    }
}

/// Store backend living in this process's memory.
///
/// Shared between tasks through `Arc`; used by the test suites and by
/// single-host setups that do not need a store server.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw entry to a list, bypassing every pool invariant.
    ///
    /// For reproducing drift and corruption left behind by other writers.
    pub async fn push_raw(&self, key: &str, payload: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.list_mut(key)?.push_back(payload.to_string());
        Ok(())
    }

    /// Add a raw sorted-set entry, bypassing every pool invariant.
    pub async fn zadd_raw(&self, key: &str, payload: &str, score: f64) -> Result<()> {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.zset_mut(key)?.insert(payload.to_string(), score);
        Ok(())
    }

    /// Remove a single set member, bypassing every pool invariant.
    pub async fn srem_raw(&self, key: &str, member: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().await;
        if keyspace.set(key)?.is_some() {
            keyspace.set_mut(key)?.remove(member);
            keyspace.prune(key);
        }
        Ok(())
    }

    /// Delete a key outright.
    pub async fn delete_raw(&self, key: &str) {
        self.keyspace.lock().await.values.remove(key);
    }

    /// Members of a set, sorted.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace
            .set(key)?
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.keyspace.lock().await.lrange(key)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.keyspace.lock().await.llen(key)
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        self.keyspace.lock().await.scard(key)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.keyspace.lock().await.values.contains_key(key))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self
            .keyspace
            .lock()
            .await
            .zset(key)?
            .map_or(0, HashMap::len))
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.keyspace.lock().await.zrange(key)
    }

    async fn commit(&self, patch: &Patch) -> Result<bool> {
        let mut keyspace = self.keyspace.lock().await;
        for guard in patch.guards() {
            if !keyspace.check(guard)? {
                return Ok(false);
            }
        }

        // Apply to a scratch copy so a type error halfway through leaves the
        // keyspace untouched.
        let mut staged = Keyspace {
            values: keyspace.values.clone(),
        };
        for op in patch.ops() {
            staged.apply(op)?;
        }
        staged.prune_all();
        *keyspace = staged;
        Ok(true)
    }

    async fn acquire(&self, keys: &PoolKeys, now: f64, max_attempts: u32) -> Result<Option<String>> {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.check_lease_keys(keys)?;
        for _ in 0..max_attempts {
            let Some(payload) = keyspace.list_mut(&keys.available)?.pop_front() else {
                keyspace.prune(&keys.available);
                return Ok(None);
            };
            keyspace.prune(&keys.available);

            let Some(account) = codec::decode_or_skip(&payload, &keys.available) else {
                continue;
            };
            let account = account.leased(now);
            let updated = codec::encode(&account)?;

            keyspace.list_mut(&keys.leased)?.push_front(updated.clone());
            keyspace.set_mut(&keys.available_index)?.remove(account.username());
            keyspace.prune(&keys.available_index);
            keyspace
                .set_mut(&keys.leased_index)?
                .insert(account.username().to_string());
            return Ok(Some(updated));
        }
        warn!(pool = keys.pool(), max_attempts, "gave up after unreadable entries");
        Ok(None)
    }

    async fn release(
        &self,
        keys: &PoolKeys,
        username: &str,
        expected: Option<&str>,
        cooldown_secs: u64,
        now: f64,
    ) -> Result<bool> {
        if username.is_empty() {
            return Ok(false);
        }
        let mut keyspace = self.keyspace.lock().await;
        keyspace.check_lease_keys(keys)?;

        let found = keyspace.list(&keys.leased)?.and_then(|items| {
            items.iter().enumerate().find_map(|(i, payload)| {
                if expected.is_some_and(|expected| expected != payload.as_str()) {
                    return None;
                }
                codec::decode(payload)
                    .ok()
                    .filter(|account| account.username() == username)
                    .map(|account| (i, account))
            })
        });
        let Some((position, account)) = found else {
            return Ok(false);
        };

        keyspace.list_mut(&keys.leased)?.remove(position);
        keyspace.prune(&keys.leased);
        for index in [&keys.leased_index, &keys.available_index] {
            if keyspace.set(index)?.is_some() {
                keyspace.set_mut(index)?.remove(username);
                keyspace.prune(index);
            }
        }

        let account = account.released(now, cooldown_secs);
        let updated = codec::encode(&account)?;
        match account.cooldown_until() {
            Some(ready_at) => {
                keyspace.zset_mut(&keys.cooldown)?.insert(updated, ready_at);
            }
            None => {
                keyspace.list_mut(&keys.available)?.push_back(updated);
                keyspace
                    .set_mut(&keys.available_index)?
                    .insert(username.to_string());
            }
        }
        Ok(true)
    }
}
