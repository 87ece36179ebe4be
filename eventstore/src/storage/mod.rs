//! Storage backends for envelope persistence and the aggregate/retry cache.
//!
//! This module provides:
//! - `duckdb`: columnar event store with all-or-nothing batch commits
//! - `cache`: key/value store with TTLs for counters, lists and estimators,
//!   held in process
//! - `redis_cache`: the same store backed by a Redis server, shared across
//!   processes
//! - `retry`: day-bucketed retry queue for batches the store rejected
//!
//! The pipeline only talks to the [`BulkWriter`] and [`cache::CacheStore`]
//! traits, so any backend with the same guarantees can be plugged in.

pub mod cache;
pub mod duckdb;
pub mod redis_cache;
pub mod retry;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::event::Batch;
use async_trait::async_trait;
use std::sync::Arc;

use self::cache::{CacheStore, MemoryCacheStore};
use self::redis_cache::RedisCacheStore;

/// Commits a closed batch to the source-of-truth store in one round trip.
///
/// Implementations must be all-or-nothing: when `commit` returns an error,
/// none of the batch's envelopes may be visible in the store. Deadlines are
/// enforced by the caller.
#[async_trait]
pub trait BulkWriter: Send + Sync + 'static {
    async fn commit(&self, batch: &Batch) -> Result<()>;
}

/// Opens the cache store named by `config.url`, or an in-process store when
/// no URL is configured.
pub async fn open_cache(config: &CacheConfig) -> Result<Arc<dyn CacheStore>> {
    match config.url.as_deref() {
        Some(url) => Ok(Arc::new(RedisCacheStore::connect(url).await?)),
        None => Ok(Arc::new(MemoryCacheStore::from_config(config))),
    }
}
