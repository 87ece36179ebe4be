//! Worker pool and the per-worker consumption loop.
//!
//! Each worker owns one [`MessageSource`] (a disjoint set of partitions) and
//! one [`BatchAssembler`]. Its loop waits on three wake conditions, checked in
//! fixed precedence:
//!
//! 1. [`Transition::Drain`]: stop was requested. Flush the partial batch,
//!    commit stream positions and exit.
//! 2. [`Transition::TimedFlush`]: the flush interval ticked. Flush the batch
//!    if it is non-empty.
//! 3. [`Transition::Ingest`]: a fetch completed. Decode and append; flush at
//!    once when the batch is full.
//!
//! A pending fetch is dropped whenever a higher-precedence condition fires,
//! so neither the timer nor the stop signal waits behind the fetch wait.
//! Flushes run inline: a worker does not fetch while its batch is being
//! committed.

use chrono::Utc;
use eventstore_core::metrics::{Counter, MetricsRegistry};
use eventstore_core::{DeliveryMetadata, Event};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often [`WorkerPool::drain`] re-reads the group lag.
const DRAIN_POLL: Duration = Duration::from_millis(10);

use crate::assembler::BatchAssembler;
use crate::broker::{ConsumerGroup, Delivery, MessageSource};
use crate::config::ConsumerConfig;
use crate::error::{PipelineError, Result};
use crate::processor::BatchProcessor;

/// One step of the worker state machine.
#[derive(Debug)]
pub enum Transition {
    Drain,
    TimedFlush,
    Ingest(Result<Option<Delivery>>),
}

struct WorkerMetrics {
    received: Arc<Counter>,
    unmarshal_errors: Arc<Counter>,
    fetch_errors: Arc<Counter>,
}

struct Worker {
    id: usize,
    source: Box<dyn MessageSource>,
    assembler: BatchAssembler,
    processor: Arc<BatchProcessor>,
    flush_interval: Duration,
    fetch_wait: Duration,
    metrics: WorkerMetrics,
}

impl Worker {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(worker = self.id, "Worker started");

        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Set after a failed fetch; the next tick re-enables fetching.
        let mut fetch_paused = false;

        loop {
            let transition = tokio::select! {
                biased;
                // Also fires when the pool is dropped.
                _ = stop.changed() => Transition::Drain,
                _ = ticker.tick() => Transition::TimedFlush,
                fetched = self.source.fetch(self.fetch_wait), if !fetch_paused => Transition::Ingest(fetched),
            };

            match transition {
                Transition::Drain => break,
                Transition::TimedFlush => {
                    fetch_paused = false;
                    self.flush().await;
                }
                Transition::Ingest(Ok(Some(delivery))) => {
                    if self.ingest(delivery) {
                        self.flush().await;
                    }
                }
                Transition::Ingest(Ok(None)) => {}
                Transition::Ingest(Err(e)) => {
                    self.metrics.fetch_errors.increment();
                    warn!(worker = self.id, error = %e, "Failed to fetch message");
                    fetch_paused = true;
                }
            }
        }

        let pending = self.assembler.len();
        self.flush().await;
        if let Err(e) = self.source.close().await {
            warn!(worker = self.id, error = %e, "Failed to close message source");
        }
        info!(worker = self.id, flushed = pending, "Worker stopped");
    }

    /// Decodes and appends one record. Returns true when the batch is full.
    fn ingest(&mut self, delivery: Delivery) -> bool {
        self.metrics.received.increment();

        let mut event = match Event::from_json(&delivery.message.value) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.unmarshal_errors.increment();
                warn!(
                    worker = self.id,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "Dropping malformed message"
                );
                return false;
            }
        };

        event.delivery = DeliveryMetadata {
            partition: Some(delivery.partition),
            offset: Some(delivery.offset),
            produced_at: Some(delivery.message.produced_at),
            consumed_at: Some(Utc::now()),
        };
        self.assembler.push(event)
    }

    async fn flush(&mut self) {
        if let Some(batch) = self.assembler.take() {
            debug!(worker = self.id, events = batch.len(), "Flushing batch");
            self.processor.process(batch).await;
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Fixed pool of workers sharing one consumer group subscription.
pub struct WorkerPool {
    group: Arc<dyn ConsumerGroup>,
    processor: Arc<BatchProcessor>,
    config: ConsumerConfig,
    metrics: Arc<MetricsRegistry>,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(
        group: Arc<dyn ConsumerGroup>,
        processor: Arc<BatchProcessor>,
        config: ConsumerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            group,
            processor,
            config,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Joins `worker_count` members to the group and spawns one task per
    /// member. Fails if the pool is already running.
    pub fn start(&self, worker_count: usize) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(PipelineError::AlreadyStarted);
        }
        if worker_count == 0 {
            return Err(PipelineError::config("worker count must be at least 1"));
        }
        // A zero period would stall the flush timer.
        if self.config.flush_interval_ms == 0 {
            return Err(PipelineError::config("flush interval must be positive"));
        }

        let sources = (0..worker_count)
            .map(|member| self.group.join(member, worker_count))
            .collect::<Result<Vec<_>>>()?;

        let (stop, stop_rx) = watch::channel(false);
        let handles = sources
            .into_iter()
            .enumerate()
            .map(|(id, source)| {
                let worker = Worker {
                    id,
                    source,
                    assembler: BatchAssembler::new(self.config.batch_size),
                    processor: self.processor.clone(),
                    flush_interval: self.config.flush_interval(),
                    fetch_wait: self.config.fetch_wait(),
                    metrics: WorkerMetrics {
                        received: self.metrics.counter("consumer.events.received"),
                        unmarshal_errors: self.metrics.counter("consumer.errors.unmarshal"),
                        fetch_errors: self.metrics.counter("consumer.errors.fetch"),
                    },
                };
                tokio::spawn(worker.run(stop_rx.clone()))
            })
            .collect();

        *running = Some(Running { stop, handles });
        info!(workers = worker_count, "Worker pool started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Waits until the workers have fetched every record in the stream, or
    /// `timeout` elapses. Returns the records still unfetched.
    ///
    /// Records fetched but not yet flushed stay in the workers' batches,
    /// and [`stop`](Self::stop) flushes those.
    pub async fn drain(&self, timeout: Duration) -> Result<u64> {
        if !self.is_running() {
            return Err(PipelineError::NotStarted);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let group = self.group.clone();
            let lag = tokio::task::spawn_blocking(move || group.lag())
                .await
                .map_err(|e| PipelineError::stream(format!("lag check failed: {}", e)))??;

            if lag == 0 {
                debug!("Worker pool drained");
                return Ok(0);
            }
            if Instant::now() >= deadline {
                warn!(unfetched = lag, "Drain deadline reached before the stream was consumed");
                return Ok(lag);
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Signals every worker, waits until each has flushed and exited, and
    /// returns the number of workers joined.
    pub async fn stop(&self) -> Result<usize> {
        let Running { stop, handles } = self
            .running
            .lock()
            .take()
            .ok_or(PipelineError::NotStarted)?;

        let _ = stop.send(true);

        let mut joined = 0;
        for result in join_all(handles).await {
            match result {
                Ok(()) => joined += 1,
                Err(e) => warn!(error = %e, "Worker task failed"),
            }
        }

        info!(workers = joined, "Worker pool stopped");
        Ok(joined)
    }
}
