//! Redis / KeyDB store backend
//!
//! Lease transitions run as Lua scripts so the pop-relabel-push sequence is a
//! single unit on the server. Guarded patches are shipped to one generic Lua
//! script that re-checks every guard against live data before applying any
//! mutation, which gives compare-and-swap semantics without a dedicated
//! WATCH connection.
//!
//! The client is owned by the store and created lazily. When a command fails
//! with a connection-level error (I/O, timeout, cancellation) the client is
//! dropped and the next call connects afresh; nothing reconnects in the middle
//! of an operation.

use std::future::Future;
use std::time::Duration;

use common::Secret;
use fred::clients::Pool;
use fred::error::{Error as FredError, ErrorKind};
use fred::interfaces::{ClientLike, KeysInterface, ListInterface, LuaInterface, SetsInterface};
use fred::types::config::{Config as FredConfig, ServerConfig};
use fred::types::{Builder, CustomCommand};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keys::PoolKeys;
use crate::store::{Guard, Op, Patch, Store};

/// Connections held by the client pool.
const POOL_SIZE: usize = 4;

/// KEYS: available, leased, available_index, leased_index
/// ARGV: now, max_attempts
///
/// Entries the record codec would reject are discarded: the username must be a
/// string with a non-blank character, the password a string, `in_use` a
/// boolean and the timestamps numbers (the optional ones may be null).
const ACQUIRE_SCRIPT: &str = r#"
local available_key = KEYS[1]
local leased_key = KEYS[2]
local available_index_key = KEYS[3]
local leased_index_key = KEYS[4]
local now = tonumber(ARGV[1])
local max_attempts = tonumber(ARGV[2]) or 100

local function optional_number(v)
    return v == nil or v == cjson.null or type(v) == 'number'
end

local function readable(account)
    return type(account) == 'table'
        and type(account['username']) == 'string'
        and string.find(account['username'], '%S') ~= nil
        and type(account['password']) == 'string'
        and (account['in_use'] == nil or type(account['in_use']) == 'boolean')
        and (account['created_at'] == nil or type(account['created_at']) == 'number')
        and optional_number(account['acquired_at'])
        and optional_number(account['released_at'])
        and optional_number(account['cooldown_until'])
end

for _ = 1, max_attempts do
    local payload = redis.call('LPOP', available_key)
    if not payload then
        return false
    end

    local ok, account = pcall(cjson.decode, payload)
    if ok and readable(account) then
        local username = account['username']
        account['in_use'] = true
        account['acquired_at'] = now
        account['released_at'] = nil
        account['cooldown_until'] = nil
        local updated = cjson.encode(account)
        redis.call('LPUSH', leased_key, updated)
        redis.call('SREM', available_index_key, username)
        redis.call('SADD', leased_index_key, username)
        return updated
    end
end

return false
"#;

/// KEYS: leased, available, leased_index, available_index, cooldown
/// ARGV: username, cooldown_secs, now, expected payload ('' matches any)
const RELEASE_SCRIPT: &str = r#"
local leased_key = KEYS[1]
local available_key = KEYS[2]
local leased_index_key = KEYS[3]
local available_index_key = KEYS[4]
local cooldown_key = KEYS[5]
local username = ARGV[1]
local cooldown_secs = tonumber(ARGV[2]) or 0
local now = tonumber(ARGV[3])
local expected = ARGV[4] or ''
local sentinel = '__lease_pool_removed__'

if not username or username == '' then
    return 0
end

local length = redis.call('LLEN', leased_key)
local account = nil

for i = 0, length - 1 do
    local payload = redis.call('LINDEX', leased_key, i)
    if payload and (expected == '' or payload == expected) then
        local ok, decoded = pcall(cjson.decode, payload)
        if ok and type(decoded) == 'table' and decoded['username'] == username then
            account = decoded
            redis.call('LSET', leased_key, i, sentinel)
            break
        end
    end
end

if not account then
    return 0
end

redis.call('LREM', leased_key, 1, sentinel)
redis.call('SREM', leased_index_key, username)
redis.call('SREM', available_index_key, username)

account['in_use'] = false
account['released_at'] = now
account['acquired_at'] = nil
account['cooldown_until'] = nil

if cooldown_secs > 0 then
    local ready_at = now + cooldown_secs
    account['cooldown_until'] = ready_at
    redis.call('ZADD', cooldown_key, ready_at, cjson.encode(account))
else
    redis.call('RPUSH', available_key, cjson.encode(account))
    redis.call('SADD', available_index_key, username)
end
return 1
"#;

/// KEYS: every key the patch touches, referenced by 1-based index
/// ARGV[1]: {"guards": [...], "ops": [...]} as built by `patch_payload`
///
/// Returns 1 when applied, 0 when a guard failed (nothing written).
const COMMIT_SCRIPT: &str = r#"
local patch = cjson.decode(ARGV[1])

local function same_list(actual, expected)
    if #actual ~= #expected then
        return false
    end
    for i = 1, #actual do
        if actual[i] ~= expected[i] then
            return false
        end
    end
    return true
end

for _, g in ipairs(patch['guards']) do
    local key = KEYS[g['k']]
    local t = g['t']
    if t == 'list' then
        if not same_list(redis.call('LRANGE', key, 0, -1), g['v']) then
            return 0
        end
    elseif t == 'zset' then
        local actual = redis.call('ZRANGE', key, 0, -1, 'WITHSCORES')
        local expected = g['v']
        if #actual ~= 2 * #expected then
            return 0
        end
        for i = 1, #expected do
            if actual[2 * i - 1] ~= expected[i][1] or tonumber(actual[2 * i]) ~= expected[i][2] then
                return 0
            end
        end
    elseif t == 'due' then
        if not same_list(redis.call('ZRANGEBYSCORE', key, '-inf', g['max']), g['v']) then
            return 0
        end
    elseif t == 'llen' then
        if redis.call('LLEN', key) ~= g['n'] then
            return 0
        end
    elseif t == 'scard' then
        if redis.call('SCARD', key) ~= g['n'] then
            return 0
        end
    else
        return redis.error_reply('unknown guard ' .. tostring(t))
    end
end

for _, op in ipairs(patch['ops']) do
    local key = KEYS[op['k']]
    local t = op['t']
    if t == 'del' then
        redis.call('DEL', key)
    elseif t == 'rpush' then
        for _, v in ipairs(op['v']) do
            redis.call('RPUSH', key, v)
        end
    elseif t == 'sadd' then
        for _, v in ipairs(op['v']) do
            redis.call('SADD', key, v)
        end
    elseif t == 'zadd' then
        for _, e in ipairs(op['v']) do
            redis.call('ZADD', key, e[2], e[1])
        end
    elseif t == 'zrem' then
        for _, v in ipairs(op['v']) do
            redis.call('ZREM', key, v)
        end
    else
        return redis.error_reply('unknown op ' .. tostring(t))
    end
end

return 1
"#;

/// Connection parameters for the store server.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub database: u8,
    pub password: Option<Secret<String>>,
    /// Upper bound on connecting and on every individual command.
    pub timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            password: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Store backed by a Redis-compatible server.
pub struct RedisStore {
    settings: RedisSettings,
    client: Mutex<Option<Pool>>,
}

impl RedisStore {
    /// Create the store. No connection is made until the first command.
    pub fn new(settings: RedisSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }

    /// Return the live client, connecting first if there is none.
    async fn connection(&self) -> Result<Pool> {
        let mut slot = self.client.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }

        let pool = self.connect().await?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    async fn connect(&self) -> Result<Pool> {
        let fred_config = FredConfig {
            server: ServerConfig::new_centralized(self.settings.host.as_str(), self.settings.port),
            database: Some(self.settings.database),
            password: self
                .settings
                .password
                .as_ref()
                .map(|secret| secret.expose().clone()),
            ..FredConfig::default()
        };

        let pool = Builder::from_config(fred_config)
            .build_pool(POOL_SIZE)
            .map_err(|e| Error::Store(format!("invalid store configuration: {e}")))?;

        let handshake = async {
            pool.init().await?;
            let _: String = pool.ping(None).await?;
            Ok::<(), FredError>(())
        };
        match tokio::time::timeout(self.settings.timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = pool.quit().await;
                return Err(Error::Unavailable(format!(
                    "connecting to {}:{}: {e}",
                    self.settings.host, self.settings.port
                )));
            }
            Err(_) => {
                let _ = pool.quit().await;
                return Err(Error::Unavailable(format!(
                    "connecting to {}:{} timed out after {:?}",
                    self.settings.host, self.settings.port, self.settings.timeout
                )));
            }
        }

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            database = self.settings.database,
            pool_size = POOL_SIZE,
            "store connection established"
        );
        Ok(pool)
    }

    /// Drop the current client so the next call reconnects.
    async fn disconnect(&self) {
        let stale = self.client.lock().await.take();
        if let Some(pool) = stale {
            let _ = pool.quit().await;
            debug!("store connection discarded");
        }
    }

    /// Run one command against the live client, mapping failures.
    async fn call<T, F, Fut>(&self, command: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Pool) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, FredError>> + Send,
        T: Send,
    {
        let pool = self.connection().await?;
        match tokio::time::timeout(self.settings.timeout, f(pool)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if is_connection_error(&e) => {
                warn!(command, error = %e, "store connection lost");
                self.disconnect().await;
                Err(Error::Unavailable(format!("{command}: {e}")))
            }
            Ok(Err(e)) => Err(Error::Store(format!("{command}: {e}"))),
            Err(_) => {
                warn!(command, timeout = ?self.settings.timeout, "store command timed out");
                self.disconnect().await;
                Err(Error::Unavailable(format!(
                    "{command} timed out after {:?}",
                    self.settings.timeout
                )))
            }
        }
    }
}

fn is_connection_error(e: &FredError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled
    )
}

/// Build the `KEYS` list and JSON argument for `COMMIT_SCRIPT`.
pub(crate) fn patch_payload(patch: &Patch) -> (Vec<String>, String) {
    let keys = patch.keys();
    let index = |key: &str| {
        keys.iter()
            .position(|k| k == key)
            .map_or(0, |position| position + 1)
    };

    let guards: Vec<serde_json::Value> = patch
        .guards()
        .iter()
        .map(|guard| match guard {
            Guard::ListEquals { key, items } => json!({"t": "list", "k": index(key), "v": items}),
            Guard::ZSetEquals { key, entries } => {
                json!({"t": "zset", "k": index(key), "v": entries})
            }
            Guard::ZSetDueEquals {
                key,
                max_score,
                members,
            } => json!({"t": "due", "k": index(key), "max": max_score, "v": members}),
            Guard::LenEquals { key, len } => json!({"t": "llen", "k": index(key), "n": len}),
            Guard::CardEquals { key, card } => json!({"t": "scard", "k": index(key), "n": card}),
        })
        .collect();

    let ops: Vec<serde_json::Value> = patch
        .ops()
        .iter()
        .map(|op| match op {
            Op::Delete { key } => json!({"t": "del", "k": index(key)}),
            Op::RPush { key, items } => json!({"t": "rpush", "k": index(key), "v": items}),
            Op::SAdd { key, members } => json!({"t": "sadd", "k": index(key), "v": members}),
            Op::ZAdd { key, entries } => json!({"t": "zadd", "k": index(key), "v": entries}),
            Op::ZRem { key, members } => json!({"t": "zrem", "k": index(key), "v": members}),
        })
        .collect();

    let body = json!({"guards": guards, "ops": ops}).to_string();
    (keys, body)
}

/// Pair up a flat `member, score, member, score, ...` reply.
fn parse_scored(flat: Vec<String>) -> Result<Vec<(String, f64)>> {
    if flat.len() % 2 != 0 {
        return Err(Error::Store(format!(
            "ZRANGE WITHSCORES returned an odd number of items ({})",
            flat.len()
        )));
    }
    let mut entries = Vec::with_capacity(flat.len() / 2);
    let mut items = flat.into_iter();
    while let (Some(member), Some(score)) = (items.next(), items.next()) {
        let score: f64 = score
            .parse()
            .map_err(|e| Error::Store(format!("unparseable score {score:?}: {e}")))?;
        entries.push((member, score));
    }
    Ok(entries)
}

impl Store for RedisStore {
    async fn ping(&self) -> Result<()> {
        self.call("PING", |pool| async move {
            let _: String = pool.ping(None).await?;
            Ok(())
        })
        .await
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.call("LRANGE", |pool| async move { pool.lrange(key, 0, -1).await })
            .await
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.call("LLEN", |pool| async move { pool.llen(key).await })
            .await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        self.call("SCARD", |pool| async move { pool.scard(key).await })
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.call("EXISTS", |pool| async move { pool.exists(key).await })
            .await
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.call("ZCARD", |pool| async move {
            ClientLike::custom(
                &pool,
                CustomCommand::new_static("ZCARD", None::<u16>, false),
                vec![key.to_string()],
            )
            .await
        })
        .await
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let flat: Vec<String> = self
            .call("ZRANGE", |pool| async move {
                ClientLike::custom(
                    &pool,
                    CustomCommand::new_static("ZRANGE", None::<u16>, false),
                    vec![
                        key.to_string(),
                        "0".to_string(),
                        "-1".to_string(),
                        "WITHSCORES".to_string(),
                    ],
                )
                .await
            })
            .await?;
        parse_scored(flat)
    }

    async fn commit(&self, patch: &Patch) -> Result<bool> {
        if patch.ops().is_empty() && patch.guards().is_empty() {
            return Ok(true);
        }
        let (keys, body) = patch_payload(patch);
        let applied: i64 = self
            .call("EVAL commit", |pool| async move {
                pool.eval(COMMIT_SCRIPT, keys, vec![body]).await
            })
            .await?;
        Ok(applied == 1)
    }

    async fn acquire(&self, keys: &PoolKeys, now: f64, max_attempts: u32) -> Result<Option<String>> {
        let script_keys = vec![
            keys.available.clone(),
            keys.leased.clone(),
            keys.available_index.clone(),
            keys.leased_index.clone(),
        ];
        let args = vec![now.to_string(), max_attempts.to_string()];
        self.call("EVAL acquire", |pool| async move {
            pool.eval(ACQUIRE_SCRIPT, script_keys, args).await
        })
        .await
    }

    async fn release(
        &self,
        keys: &PoolKeys,
        username: &str,
        expected: Option<&str>,
        cooldown_secs: u64,
        now: f64,
    ) -> Result<bool> {
        let script_keys = vec![
            keys.leased.clone(),
            keys.available.clone(),
            keys.leased_index.clone(),
            keys.available_index.clone(),
            keys.cooldown.clone(),
        ];
        let args = vec![
            username.to_string(),
            cooldown_secs.to_string(),
            now.to_string(),
            expected.unwrap_or_default().to_string(),
        ];
        let released: i64 = self
            .call("EVAL release", |pool| async move {
                pool.eval(RELEASE_SCRIPT, script_keys, args).await
            })
            .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_payload_indexes_keys_from_one() {
        let mut patch = Patch::new();
        patch
            .guard(Guard::LenEquals {
                key: "p".into(),
                len: 2,
            })
            .delete("p:used")
            .rpush("p", vec!["a".into()])
            .zadd("p:cooldown", vec![("b".into(), 12.5)]);

        let (keys, body) = patch_payload(&patch);
        assert_eq!(keys, vec!["p", "p:used", "p:cooldown"]);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["guards"][0]["t"], "llen");
        assert_eq!(json["guards"][0]["k"], 1);
        assert_eq!(json["guards"][0]["n"], 2);
        assert_eq!(json["ops"][0]["t"], "del");
        assert_eq!(json["ops"][0]["k"], 2);
        assert_eq!(json["ops"][1]["v"][0], "a");
        assert_eq!(json["ops"][2]["k"], 3);
        assert_eq!(json["ops"][2]["v"][0][0], "b");
        assert_eq!(json["ops"][2]["v"][0][1], 12.5);
    }

    #[test]
    fn due_guard_carries_score_bound() {
        let mut patch = Patch::new();
        patch.guard(Guard::ZSetDueEquals {
            key: "p:cooldown".into(),
            max_score: 1_700_000_000.25,
            members: vec!["x".into()],
        });
        let (_, body) = patch_payload(&patch);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["guards"][0]["t"], "due");
        assert_eq!(json["guards"][0]["max"], 1_700_000_000.25);
        assert_eq!(json["ops"], serde_json::json!([]));
    }

    #[test]
    fn acquire_script_checks_every_decoded_field() {
        for field in [
            "username",
            "password",
            "in_use",
            "created_at",
            "acquired_at",
            "released_at",
            "cooldown_until",
        ] {
            assert!(
                ACQUIRE_SCRIPT.contains(&format!("account['{field}']")),
                "acquire script does not validate {field}"
            );
        }
        // Blank usernames are rejected by pattern, not only by equality with ''.
        assert!(ACQUIRE_SCRIPT.contains("'%S'"));
    }

    #[test]
    fn release_script_can_pin_the_observed_payload() {
        assert!(RELEASE_SCRIPT.contains("local expected = ARGV[4]"));
        assert!(RELEASE_SCRIPT.contains("payload == expected"));
    }

    #[test]
    fn parse_scored_pairs_members() {
        let flat = vec!["a".into(), "1.5".into(), "b".into(), "20".into()];
        let entries = parse_scored(flat).unwrap();
        assert_eq!(entries, vec![("a".to_string(), 1.5), ("b".to_string(), 20.0)]);
    }

    #[test]
    fn parse_scored_rejects_odd_and_garbage() {
        assert!(parse_scored(vec!["a".into()]).is_err());
        assert!(parse_scored(vec!["a".into(), "nope".into()]).is_err());
    }

    #[test]
    fn default_settings_point_at_local_server() {
        let settings = RedisSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 6379);
        assert_eq!(settings.database, 0);
        assert!(settings.password.is_none());
    }

    #[tokio::test]
    async fn new_store_does_not_connect() {
        // Port 1 is never a Redis server; construction must not touch it.
        let store = RedisStore::new(RedisSettings {
            port: 1,
            timeout: Duration::from_millis(200),
            ..RedisSettings::default()
        });
        assert_eq!(store.settings().port, 1);
        assert!(store.client.lock().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let store = RedisStore::new(RedisSettings {
            host: "127.0.0.1".into(),
            port: 1,
            timeout: Duration::from_millis(500),
            ..RedisSettings::default()
        });
        let err = store.ping().await.unwrap_err();
        assert!(err.is_unavailable(), "got: {err}");
        assert!(store.client.lock().await.is_none());
    }
}
