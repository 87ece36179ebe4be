//! Configuration for the columnar store, the cache store and the policies
//! layered on top of them.
//!
//! These structures are deserialized by the application from its layered
//! configuration (embedded defaults, files, `EVENTSTREAM__*` environment
//! variables, CLI flags). Every field has a default, so partial sections are
//! accepted.
//!
//! ```toml
//! [store]
//! connection = ":memory:"   # or a file path
//! pool_size = 4
//! threads = 2
//!
//! [cache]
//! url = "redis://127.0.0.1:6379"   # omit for an in-process cache
//! eviction_interval_secs = 60
//! retry_ttl_secs = 86400
//! hourly_ttl_secs = 172800
//! daily_users_ttl_secs = 604800
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Columnar store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// DuckDB connection string, `:memory:` or a database file path
    pub connection: String,
    /// Number of pooled connections shared by all workers
    pub pool_size: usize,
    /// DuckDB worker threads per database, unset for the engine default
    pub threads: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: ":memory:".to_string(),
            pool_size: 4,
            threads: None,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(StoreError::config("store.pool_size must be at least 1"));
        }
        if self.connection.is_empty() {
            return Err(StoreError::config("store.connection must not be empty"));
        }
        Ok(())
    }
}

/// Cache/aggregate store configuration and retention policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis server holding retry lists and aggregates. Unset keeps them in
    /// process, where they do not survive a restart.
    pub url: Option<String>,
    /// Minimum interval between physical sweeps of expired keys
    pub eviction_interval_secs: u64,
    /// Retention of a day's retry list, refreshed on every append
    pub retry_ttl_secs: u64,
    /// Retention of an hourly counter bucket
    pub hourly_ttl_secs: u64,
    /// Retention of a daily unique-user estimator
    pub daily_users_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            eviction_interval_secs: 60,
            retry_ttl_secs: 24 * 3600,
            hourly_ttl_secs: 48 * 3600,
            daily_users_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl CacheConfig {
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn retry_ttl(&self) -> Duration {
        Duration::from_secs(self.retry_ttl_secs)
    }

    pub fn hourly_ttl(&self) -> Duration {
        Duration::from_secs(self.hourly_ttl_secs)
    }

    pub fn daily_users_ttl(&self) -> Duration {
        Duration::from_secs(self.daily_users_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if matches!(self.url.as_deref(), Some(url) if url.trim().is_empty()) {
            return Err(StoreError::config("cache.url must not be empty"));
        }
        if self.retry_ttl_secs == 0 || self.hourly_ttl_secs == 0 || self.daily_users_ttl_secs == 0 {
            return Err(StoreError::config("cache TTLs must be non-zero"));
        }
        // Recently closed buckets must stay queryable.
        if self.hourly_ttl_secs <= 3600 {
            return Err(StoreError::config(
                "cache.hourly_ttl_secs must exceed the one-hour bucket",
            ));
        }
        if self.daily_users_ttl_secs <= 24 * 3600 {
            return Err(StoreError::config(
                "cache.daily_users_ttl_secs must exceed the one-day bucket",
            ));
        }
        Ok(())
    }
}
