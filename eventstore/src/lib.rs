/*!
# Eventstore: Columnar Event Storage and Real-time Aggregates

Eventstore is the storage half of the event ingestion pipeline. It owns the
event envelope, commits closed batches to an embedded DuckDB columnar store,
keeps a day-bucketed retry queue for batches the store rejected, and
maintains approximate real-time aggregates once a batch is durable.

## Key Features

### All-or-nothing Batch Commits
- Batches are encoded as Arrow `RecordBatch`es and bound into one prepared
  statement inside one transaction
- A failed commit leaves no rows behind
- A pool of connections to the same database is shared by all workers

### Retry Queue
- Envelopes of a failed batch are serialized individually into
  `failed_events:<YYYYMMDD>`, keyed by the day of the flush attempt
- The list's TTL (24h) is refreshed on every append
- Lists can be drained for operator-triggered reprocessing

### Cache Backends
- `RedisCacheStore` keeps retry lists and aggregates in Redis, so a later
  process can drain what an earlier one parked (`[cache] url = "redis://..."`)
- `MemoryCacheStore` keeps them in process for tests and single-run setups

### Real-Time Aggregates
- Hourly per-type counters in `stats:hourly:<YYYY-MM-DD-HH>` (TTL 48h)
- Daily unique users in `users:daily:<YYYY-MM-DD>` HyperLogLogs (TTL 7d,
  16 KiB per day, ~0.81% standard error)

## Usage

```rust,no_run
use eventstore_core::config::{CacheConfig, StoreConfig};
use eventstore_core::metrics::MetricsRegistry;
use eventstore_core::storage::cache::MemoryCacheStore;
use eventstore_core::storage::duckdb::DuckDbEventStore;
use eventstore_core::{Batch, BulkWriter, NewEvent, RealtimeAggregator};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let metrics = MetricsRegistry::new();
    let store = DuckDbEventStore::open(&StoreConfig::default())?;
    let cache = Arc::new(MemoryCacheStore::default());
    let realtime = RealtimeAggregator::new(cache, &CacheConfig::default(), &metrics);

    let event = NewEvent {
        user_id: "user-1".to_string(),
        ..Default::default()
    }
    .normalize(Utc::now());
    let batch = Batch::new(vec![event], Instant::now());

    store.commit(&batch).await?;
    realtime.update(&batch).await;
    Ok(())
}
```

See the [`storage`](crate::storage) module for the store and cache traits.
*/

pub mod aggregation;
pub mod config;
pub mod error;
pub mod event;
pub mod hyperloglog;
pub mod metrics;
pub mod realtime;
pub mod storage;

pub use error::{Result, StoreError};
pub use event::{Batch, DeliveryMetadata, Event, EventType, NewEvent};
pub use hyperloglog::HyperLogLog;
pub use metrics::MetricsRegistry;
pub use realtime::RealtimeAggregator;
pub use storage::cache::{CacheStore, MemoryCacheStore};
pub use storage::retry::RetrySink;
pub use storage::redis_cache::RedisCacheStore;
pub use storage::{open_cache, BulkWriter};
