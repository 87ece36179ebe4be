//! Day-bucketed retry queue for batches the columnar store rejected.
//!
//! Each envelope of a failed batch is serialized on its own and appended to
//! `failed_events:<YYYYMMDD>`, keyed by the UTC day of the flush attempt. The
//! list's TTL is refreshed on every append, so a day's list lives until one
//! retention period after its last failure. Failures of the sink itself are
//! logged and dropped.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::aggregation::{failed_events_key, failed_events_key_for_day};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::event::{Batch, Event};
use crate::metrics::{Counter, MetricsRegistry};
use crate::storage::cache::CacheStore;

pub struct RetrySink {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    stored: Arc<Counter>,
    errors: Arc<Counter>,
}

impl RetrySink {
    pub fn new(cache: Arc<dyn CacheStore>, config: &CacheConfig, metrics: &MetricsRegistry) -> Self {
        Self {
            cache,
            ttl: config.retry_ttl(),
            stored: metrics.counter("retry.events.stored"),
            errors: metrics.counter("retry.errors"),
        }
    }

    /// Appends every envelope of `batch` to today's retry list. Returns the
    /// number of envelopes stored.
    pub async fn store(&self, batch: &Batch) -> usize {
        self.store_at(batch, Utc::now()).await
    }

    /// Same as [`store`](Self::store) for a flush attempt made at `now`.
    pub async fn store_at(&self, batch: &Batch, now: DateTime<Utc>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let key = failed_events_key(now);
        let mut values = Vec::with_capacity(batch.len());
        for event in batch.events() {
            match serde_json::to_string(event) {
                Ok(value) => values.push(value),
                Err(e) => {
                    self.errors.increment();
                    warn!(event_id = %event.id, error = %e, "Dropping unserializable retry entry");
                }
            }
        }
        if values.is_empty() {
            return 0;
        }

        let count = values.len();
        if let Err(e) = self.cache.rpush(&key, values).await {
            self.errors.increment();
            error!(key = %key, events = count, error = %e, "Failed to store batch in retry list");
            return 0;
        }
        self.stored.increment_by(count as u64);

        if let Err(e) = self.cache.expire(&key, self.ttl).await {
            self.errors.increment();
            error!(key = %key, error = %e, "Failed to refresh retry list TTL");
        }

        debug!(key = %key, events = count, "Stored failed batch for retry");
        count
    }

    /// Raw entries waiting in a day's retry list.
    pub async fn pending(&self, day: NaiveDate) -> Result<Vec<String>> {
        self.cache.lrange(&failed_events_key_for_day(day)).await
    }

    /// Removes a day's retry list and decodes its entries. Entries that no
    /// longer decode are logged, counted and skipped.
    pub async fn drain(&self, day: NaiveDate) -> Result<Vec<Event>> {
        let key = failed_events_key_for_day(day);
        let entries = self.cache.take_list(&key).await?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match Event::from_json(entry.as_bytes()) {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.errors.increment();
                    warn!(key = %key, error = %e, "Skipping undecodable retry entry");
                }
            }
        }
        Ok(events)
    }
}
