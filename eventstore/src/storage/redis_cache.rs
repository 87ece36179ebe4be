//! Redis-backed [`CacheStore`].
//!
//! The retry lists, hourly counters and daily HyperLogLogs live in Redis, so
//! they outlive the process: a batch parked for retry by one run can be
//! drained by `eventstream reprocess` in another. Every call goes through a
//! shared [`ConnectionManager`], which reconnects on its own after a dropped
//! connection.
//!
//! ```toml
//! [cache]
//! url = "redis://127.0.0.1:6379"
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::storage::cache::CacheStore;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Cache(err.to_string())
    }
}

#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    /// Connects to the Redis server at `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis cache store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn rpush(&self, key: &str, values: Vec<String>) -> Result<usize> {
        let mut conn = self.conn.clone();
        if values.is_empty() {
            return Ok(conn.llen(key).await?);
        }
        Ok(conn.rpush(key, values).await?)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn take_list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        // LRANGE and DEL in one MULTI so concurrent appends are not lost.
        let (values,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(key, 0, -1)
            .del(key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn pfadd(&self, key: &str, members: &[String]) -> Result<bool> {
        if members.is_empty() {
            return Ok(false);
        }
        let mut conn = self.conn.clone();
        Ok(conn.pfadd(key, members).await?)
    }

    async fn pfcount(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.pfcount(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().max(1) as u64;
        Ok(redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis)
            .query_async(&mut conn)
            .await?)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: missing key, -1: no expiry
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connects to the server named by `EVENTSTREAM_TEST_REDIS_URL`, or
    /// returns `None` so the test is skipped on machines without Redis.
    async fn test_store() -> Option<RedisCacheStore> {
        let url = std::env::var("EVENTSTREAM_TEST_REDIS_URL").ok()?;
        Some(RedisCacheStore::connect(&url).await.unwrap())
    }

    fn unique(prefix: &str) -> String {
        format!("{}:{}", prefix, uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = RedisCacheStore::connect("not a redis url").await;
        assert!(matches!(result, Err(StoreError::Cache(_))));
    }

    #[tokio::test]
    async fn test_list_roundtrip_and_take() {
        let Some(store) = test_store().await else {
            return;
        };
        let key = unique("failed_events");

        assert_eq!(store.rpush(&key, vec!["a".into(), "b".into()]).await.unwrap(), 2);
        assert_eq!(store.rpush(&key, vec!["c".into()]).await.unwrap(), 3);
        assert!(store.expire(&key, Duration::from_secs(86_400)).await.unwrap());
        let ttl = store.ttl(&key).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(86_000));

        assert_eq!(store.lrange(&key).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.take_list(&key).await.unwrap(), vec!["a", "b", "c"]);
        assert!(store.take_list(&key).await.unwrap().is_empty());
        assert_eq!(store.ttl(&key).await.unwrap(), None);
        assert!(!store.expire(&key, Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_and_unique_users() {
        let Some(store) = test_store().await else {
            return;
        };
        let stats = unique("stats:hourly");
        let users = unique("users:daily");

        assert_eq!(store.hincr_by(&stats, "page_view", 2).await.unwrap(), 2);
        assert_eq!(store.hincr_by(&stats, "page_view", 3).await.unwrap(), 5);
        assert_eq!(store.hincr_by(&stats, "purchase", 1).await.unwrap(), 1);
        let counts = store.hgetall(&stats).await.unwrap();
        assert_eq!(counts.get("page_view"), Some(&5));
        assert_eq!(counts.get("purchase"), Some(&1));

        let members: Vec<String> = (0..200).map(|i| format!("user-{}", i)).collect();
        assert!(store.pfadd(&users, &members).await.unwrap());
        assert!(!store.pfadd(&users, &members[..10]).await.unwrap());
        let estimate = store.pfcount(&users).await.unwrap();
        assert!((195..=205).contains(&estimate));

        let mut conn = store.conn.clone();
        let _: () = conn.del(vec![stats, users]).await.unwrap();
    }
}
