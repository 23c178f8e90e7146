//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The store password is loaded from the LEASE_STORE_PASSWORD env var or
//! password_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use lease_pool::RedisSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub admin: AdminConfig,
}

/// Shared key-value store connection
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: u8,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the store password (alternative to LEASE_STORE_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

/// Pool served by this instance
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_name")]
    pub name: String,
    /// Cooldown applied to leases reclaimed by expiry cleanup
    #[serde(default = "default_abandoned_cooldown")]
    pub abandoned_cooldown_secs: u64,
    /// Age at which a lease counts as abandoned
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

/// Admin HTTP listener
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_store_timeout() -> u64 {
    5
}

fn default_pool_name() -> String {
    "account_pool_v3".to_string()
}

fn default_abandoned_cooldown() -> u64 {
    lease_pool::DEFAULT_ABANDONED_COOLDOWN_SECS
}

fn default_lease_timeout() -> u64 {
    3600
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_max_connections() -> usize {
    64
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: 0,
            password: None,
            password_file: None,
            timeout_secs: default_store_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            abandoned_cooldown_secs: default_abandoned_cooldown(),
            lease_timeout_secs: default_lease_timeout(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl StoreConfig {
    /// Connection settings for the store client.
    pub fn settings(&self) -> RedisSettings {
        RedisSettings {
            host: self.host.clone(),
            port: self.port,
            database: self.database,
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl PoolConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. LEASE_STORE_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| common::Error::io(path, e))?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.store.host.trim().is_empty() {
            return Err(common::Error::Config("store.host must not be empty".into()));
        }

        if config.store.timeout_secs == 0 {
            return Err(common::Error::Config(
                "store.timeout_secs must be greater than 0".into(),
            ));
        }

        if config.pool.name.trim().is_empty() {
            return Err(common::Error::Config("pool.name must not be empty".into()));
        }

        if config.pool.lease_timeout_secs == 0 {
            return Err(common::Error::Config(
                "pool.lease_timeout_secs must be greater than 0".into(),
            ));
        }

        if config.pool.maintenance_interval_secs == 0 {
            return Err(common::Error::Config(
                "pool.maintenance_interval_secs must be greater than 0".into(),
            ));
        }

        if config.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "admin.max_connections must be greater than 0".into(),
            ));
        }

        // Resolve password: env var takes precedence over file
        if let Ok(password) = std::env::var("LEASE_STORE_PASSWORD") {
            config.store.password = Some(Secret::new(password));
        } else if let Some(ref password_file) = config.store.password_file {
            let password = std::fs::read_to_string(password_file)
                .map_err(|e| common::Error::io(password_file, e))?;
            let password = password.trim().to_owned();
            if !password.is_empty() {
                config.store.password = Some(Secret::new(password));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("account-lease-admin.toml")
    }
}
