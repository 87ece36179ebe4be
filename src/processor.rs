//! Flush path shared by all workers: bulk commit with a deadline, then either
//! the real-time aggregates (success) or the retry sink (failure).

use chrono::NaiveDate;
use eventstore_core::config::CacheConfig;
use eventstore_core::metrics::{Counter, Histogram, MetricsRegistry};
use eventstore_core::{Batch, BulkWriter, CacheStore, RealtimeAggregator, RetrySink, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::ConsumerConfig;
use crate::error::Result;

/// What happened to a flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Durably written; aggregates updated
    Committed(usize),
    /// Commit failed; envelopes redirected to the retry list
    Retried(usize),
}

/// Summary of one reprocessing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprocessReport {
    pub drained: usize,
    pub committed: usize,
    pub retried: usize,
}

pub struct BatchProcessor {
    writer: Arc<dyn BulkWriter>,
    retry: RetrySink,
    realtime: RealtimeAggregator,
    commit_deadline: Duration,
    batch_size: usize,
    processed: Arc<Counter>,
    insert_errors: Arc<Counter>,
    processing_time: Arc<Histogram>,
}

impl BatchProcessor {
    pub fn new(
        writer: Arc<dyn BulkWriter>,
        cache: Arc<dyn CacheStore>,
        consumer: &ConsumerConfig,
        cache_config: &CacheConfig,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            writer,
            retry: RetrySink::new(cache.clone(), cache_config, metrics),
            realtime: RealtimeAggregator::new(cache, cache_config, metrics),
            commit_deadline: consumer.commit_deadline(),
            batch_size: consumer.batch_size.max(1),
            processed: metrics.counter("consumer.events.processed"),
            insert_errors: metrics.counter("consumer.errors.insert"),
            processing_time: metrics.histogram("consumer.batch.processing_time"),
        }
    }

    pub fn realtime(&self) -> &RealtimeAggregator {
        &self.realtime
    }

    pub fn retry_sink(&self) -> &RetrySink {
        &self.retry
    }

    /// Commits `batch` as a whole. On any failure, including an expired
    /// deadline, every envelope goes to the retry list.
    pub async fn process(&self, batch: Batch) -> FlushOutcome {
        let start = Instant::now();
        let events = batch.len();

        let result = match tokio::time::timeout(self.commit_deadline, self.writer.commit(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::timeout(format!(
                "commit exceeded {}ms",
                self.commit_deadline.as_millis()
            ))),
        };

        let outcome = match result {
            Ok(()) => {
                self.processed.increment_by(events as u64);
                self.realtime.update(&batch).await;
                FlushOutcome::Committed(events)
            }
            Err(e) => {
                self.insert_errors.increment();
                error!(events, error = %e, "Batch commit failed, storing for retry");
                self.retry.store(&batch).await;
                FlushOutcome::Retried(events)
            }
        };

        let elapsed = start.elapsed();
        self.processing_time.observe(elapsed);
        debug!(
            events,
            elapsed_ms = elapsed.as_millis() as u64,
            age_ms = batch.opened_at().elapsed().as_millis() as u64,
            "Processed batch"
        );
        outcome
    }

    /// Drains a day's retry list and runs it back through [`process`] in
    /// batches of the configured size. Batches that fail again land in the
    /// current day's list.
    ///
    /// [`process`]: Self::process
    pub async fn reprocess(&self, day: NaiveDate) -> Result<ReprocessReport> {
        let events = self.retry.drain(day).await?;
        let mut report = ReprocessReport {
            drained: events.len(),
            ..Default::default()
        };

        let mut events = events.into_iter().peekable();
        while events.peek().is_some() {
            let chunk: Vec<_> = events.by_ref().take(self.batch_size).collect();
            match self.process(Batch::new(chunk, Instant::now())).await {
                FlushOutcome::Committed(n) => report.committed += n,
                FlushOutcome::Retried(n) => report.retried += n,
            }
        }

        info!(
            day = %day,
            drained = report.drained,
            committed = report.committed,
            retried = report.retried,
            "Reprocessed retry list"
        );
        Ok(report)
    }
}
