//! Key/value cache store for real-time aggregates and the retry queue.
//!
//! [`CacheStore`] is the narrow, Redis-shaped surface the pipeline needs:
//! lists for the retry queue, integer hashes for hourly counters and
//! HyperLogLog estimators for daily unique users, all with per-key TTLs.
//!
//! [`MemoryCacheStore`] keeps everything in process. Expired keys are
//! invisible to reads immediately, and are physically removed by a sweep that
//! runs at most once per eviction interval.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{Result, StoreError};
use crate::hyperloglog::HyperLogLog;

#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Appends values to the tail of a list, returning the new length.
    async fn rpush(&self, key: &str, values: Vec<String>) -> Result<usize>;

    /// Returns the whole list, empty when the key is missing.
    async fn lrange(&self, key: &str) -> Result<Vec<String>>;

    /// Returns the whole list and deletes the key.
    async fn take_list(&self, key: &str) -> Result<Vec<String>>;

    /// Adds `delta` to a hash field, returning the new value.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>>;

    /// Adds members to a cardinality estimator. Returns true when the
    /// estimator changed.
    async fn pfadd(&self, key: &str, members: &[String]) -> Result<bool>;

    async fn pfcount(&self, key: &str) -> Result<u64>;

    /// Sets the key's time to live. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live, `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

#[derive(Debug)]
enum CacheValue {
    List(Vec<String>),
    Hash(HashMap<String, i64>),
    HyperLogLog(Box<HyperLogLog>),
}

impl CacheValue {
    fn kind(&self) -> &'static str {
        match self {
            CacheValue::List(_) => "list",
            CacheValue::Hash(_) => "hash",
            CacheValue::HyperLogLog(_) => "hyperloglog",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str, expected: &str, found: &CacheValue) -> StoreError {
    StoreError::cache(format!(
        "WRONGTYPE key {} holds a {}, not a {}",
        key,
        found.kind(),
        expected
    ))
}

/// Rate limiter for physical sweeps of expired keys.
#[derive(Debug)]
struct EvictionSchedule {
    last_eviction: Mutex<Instant>,
    min_eviction_interval: Duration,
}

impl EvictionSchedule {
    fn new(min_eviction_interval: Duration) -> Self {
        Self {
            last_eviction: Mutex::new(Instant::now()),
            min_eviction_interval,
        }
    }

    /// Returns true, and records the sweep, when enough time has passed
    /// since the previous one.
    fn should_evict(&self, now: Instant) -> bool {
        let mut last = self.last_eviction.lock();
        if now.saturating_duration_since(*last) < self.min_eviction_interval {
            return false;
        }
        *last = now;
        true
    }
}

/// In-process [`CacheStore`] with per-key expiry.
#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
    eviction: EvictionSchedule,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MemoryCacheStore {
    pub fn new(eviction_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            eviction: EvictionSchedule::new(eviction_interval),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.eviction_interval())
    }

    /// Number of keys physically held, including expired keys that have not
    /// been swept yet.
    pub fn key_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Runs `f` on the entry map after sweeping and dropping `key` if it has
    /// expired.
    fn with_entries<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if self.eviction.should_evict(now) {
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            let removed = before - entries.len();
            if removed > 0 {
                debug!(removed, "Evicted expired cache keys");
            }
        }

        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }

        f(&mut entries)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn rpush(&self, key: &str, values: Vec<String>) -> Result<usize> {
        self.with_entries(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: CacheValue::List(Vec::new()),
                expires_at: None,
            });
            match &mut entry.value {
                CacheValue::List(list) => {
                    list.extend(values);
                    Ok(list.len())
                }
                other => Err(wrong_type(key, "list", other)),
            }
        })
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.with_entries(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(CacheValue::List(list)) => Ok(list.clone()),
            Some(other) => Err(wrong_type(key, "list", other)),
        })
    }

    async fn take_list(&self, key: &str) -> Result<Vec<String>> {
        self.with_entries(key, |entries| match entries.remove(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: CacheValue::List(list),
                ..
            }) => Ok(list),
            Some(entry) => {
                let err = wrong_type(key, "list", &entry.value);
                entries.insert(key.to_string(), entry);
                Err(err)
            }
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.with_entries(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: CacheValue::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                CacheValue::Hash(hash) => {
                    let value = hash.entry(field.to_string()).or_insert(0);
                    *value += delta;
                    Ok(*value)
                }
                other => Err(wrong_type(key, "hash", other)),
            }
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>> {
        self.with_entries(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(CacheValue::Hash(hash)) => Ok(hash.clone()),
            Some(other) => Err(wrong_type(key, "hash", other)),
        })
    }

    async fn pfadd(&self, key: &str, members: &[String]) -> Result<bool> {
        self.with_entries(key, |entries| {
            let mut created = false;
            let entry = entries.entry(key.to_string()).or_insert_with(|| {
                created = true;
                Entry {
                    value: CacheValue::HyperLogLog(Box::default()),
                    expires_at: None,
                }
            });
            match &mut entry.value {
                CacheValue::HyperLogLog(hll) => {
                    let mut changed = created;
                    for member in members {
                        changed |= hll.insert(member.as_str());
                    }
                    Ok(changed)
                }
                other => Err(wrong_type(key, "hyperloglog", other)),
            }
        })
    }

    async fn pfcount(&self, key: &str) -> Result<u64> {
        self.with_entries(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(CacheValue::HyperLogLog(hll)) => Ok(hll.count()),
            Some(other) => Err(wrong_type(key, "hyperloglog", other)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(key, |entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.with_entries(key, |entries| {
            let now = Instant::now();
            Ok(entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| at.saturating_duration_since(now)))
        })
    }
}
