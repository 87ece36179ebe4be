//! Real-time aggregates maintained after a batch is durably written.
//!
//! For every committed batch the aggregator:
//! - increments `stats:hourly:<YYYY-MM-DD-HH>` (event_type -> count) for the
//!   hour of each event's own timestamp, TTL 48h
//! - adds each `user_id` to the `users:daily:<YYYY-MM-DD>` HyperLogLog for the
//!   day of the event's timestamp, TTL 7d
//!
//! Updates are first grouped per key within the batch, then applied key by
//! key. A failing key is logged and counted and the remaining keys are still
//! applied; nothing is surfaced to the caller.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::aggregation::{daily_users_key, daily_users_key_for_day, hourly_stats_key};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::event::{Batch, Event, EventType};
use crate::metrics::{Counter, MetricsRegistry};
use crate::storage::cache::CacheStore;

/// Per-key deltas of one batch.
#[derive(Debug, Default, PartialEq)]
pub struct BatchAggregates {
    /// hourly key -> event type -> count
    pub hourly: BTreeMap<String, BTreeMap<EventType, i64>>,
    /// daily key -> distinct user ids
    pub daily_users: BTreeMap<String, BTreeSet<String>>,
}

impl BatchAggregates {
    pub fn from_events(events: &[Event]) -> Self {
        let mut aggregates = Self::default();

        for event in events {
            *aggregates
                .hourly
                .entry(hourly_stats_key(event.timestamp))
                .or_default()
                .entry(event.event_type)
                .or_insert(0) += 1;

            aggregates
                .daily_users
                .entry(daily_users_key(event.timestamp))
                .or_default()
                .insert(event.user_id.clone());
        }

        aggregates
    }
}

pub struct RealtimeAggregator {
    cache: Arc<dyn CacheStore>,
    hourly_ttl: Duration,
    daily_users_ttl: Duration,
    errors: Arc<Counter>,
}

impl RealtimeAggregator {
    pub fn new(cache: Arc<dyn CacheStore>, config: &CacheConfig, metrics: &MetricsRegistry) -> Self {
        Self {
            cache,
            hourly_ttl: config.hourly_ttl(),
            daily_users_ttl: config.daily_users_ttl(),
            errors: metrics.counter("realtime.errors"),
        }
    }

    /// Applies the aggregates of a committed batch. Best effort.
    pub async fn update(&self, batch: &Batch) {
        let aggregates = BatchAggregates::from_events(batch.events());

        for (key, counts) in &aggregates.hourly {
            if let Err(e) = self.apply_hourly(key, counts).await {
                self.errors.increment();
                warn!(key = %key, error = %e, "Failed to update hourly stats");
            }
        }

        for (key, users) in aggregates.daily_users {
            let users: Vec<String> = users.into_iter().collect();
            if let Err(e) = self.apply_daily_users(&key, &users).await {
                self.errors.increment();
                warn!(key = %key, error = %e, "Failed to update daily users");
            }
        }

        debug!(events = batch.len(), "Updated real-time aggregates");
    }

    async fn apply_hourly(&self, key: &str, counts: &BTreeMap<EventType, i64>) -> Result<()> {
        for (event_type, count) in counts {
            self.cache.hincr_by(key, event_type.as_str(), *count).await?;
        }
        self.cache.expire(key, self.hourly_ttl).await?;
        Ok(())
    }

    async fn apply_daily_users(&self, key: &str, users: &[String]) -> Result<()> {
        self.cache.pfadd(key, users).await?;
        self.cache.expire(key, self.daily_users_ttl).await?;
        Ok(())
    }

    /// Event counts per type for the hour containing `hour`.
    pub async fn hourly_counts(&self, hour: DateTime<Utc>) -> Result<BTreeMap<EventType, i64>> {
        let fields = self.cache.hgetall(&hourly_stats_key(hour)).await?;
        Ok(fields
            .into_iter()
            .filter_map(|(field, count)| EventType::parse(&field).map(|ty| (ty, count)))
            .collect())
    }

    /// Estimated number of distinct users seen on `day`.
    pub async fn unique_users(&self, day: NaiveDate) -> Result<u64> {
        self.cache.pfcount(&daily_users_key_for_day(day)).await
    }
}
