//! Wiring of every pipeline component from [`Settings`].
//!
//! `stream.backend` picks the in-process broker or Kafka, and `cache.url`
//! picks Redis over the in-process cache.

use eventstore_core::metrics::MetricsRegistry;
use eventstore_core::storage::duckdb::DuckDbEventStore;
use eventstore_core::{open_cache, CacheStore};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{ConsumerGroup, InMemoryBroker, MessageSink};
use crate::config::{Settings, StreamBackend, StreamConfig};
use crate::error::{PipelineError, Result};
use crate::processor::BatchProcessor;
use crate::publisher::Publisher;
use crate::service::EventService;
use crate::worker::WorkerPool;

/// A fully wired pipeline: ingest service, publisher, stream, worker pool
/// and storage.
pub struct Pipeline {
    pub metrics: Arc<MetricsRegistry>,
    pub store: DuckDbEventStore,
    pub cache: Arc<dyn CacheStore>,
    pub processor: Arc<BatchProcessor>,
    pub workers: WorkerPool,
    pub service: EventService,
    publisher: Arc<Publisher>,
    settings: Settings,
}

impl Pipeline {
    /// Opens the stores and builds every component. Workers are not started.
    /// Must be called inside a Tokio runtime.
    pub async fn build(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let metrics = Arc::new(MetricsRegistry::new());
        let store = DuckDbEventStore::open(&settings.store)?;
        let cache = open_cache(&settings.cache).await?;
        let (sink, group) = open_stream(&settings.stream)?;

        let processor = Arc::new(BatchProcessor::new(
            Arc::new(store.clone()),
            cache.clone(),
            &settings.consumer,
            &settings.cache,
            &metrics,
        ));
        let workers = WorkerPool::new(
            group,
            processor.clone(),
            settings.consumer.clone(),
            metrics.clone(),
        );
        let publisher = Arc::new(Publisher::new(sink, &settings.publisher, &metrics));
        let service = EventService::new(publisher.clone(), &metrics);

        Ok(Self {
            metrics,
            store,
            cache,
            processor,
            workers,
            service,
            publisher,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Starts the configured number of workers.
    pub fn start(&self) -> Result<()> {
        self.workers.start(self.settings.consumer.workers)
    }

    /// Pushes buffered publishes to the stream, waits up to
    /// `stream.drain_timeout_ms` for the workers to read everything in it,
    /// then stops them. Stopping flushes their partial batches. Returns the
    /// number of workers joined.
    pub async fn shutdown(&self) -> Result<usize> {
        self.publisher.flush().await?;

        match self.workers.drain(self.settings.stream.drain_timeout()).await {
            Ok(0) => {}
            Ok(unfetched) => warn!(unfetched, "Stopping workers before the stream was fully read"),
            Err(PipelineError::NotStarted) => return Err(PipelineError::NotStarted),
            Err(e) => warn!(error = %e, "Failed to drain the stream before stopping"),
        }

        let joined = self.workers.stop().await?;
        info!(workers = joined, "Pipeline shut down");
        Ok(joined)
    }
}

fn open_stream(config: &StreamConfig) -> Result<(Arc<dyn MessageSink>, Arc<dyn ConsumerGroup>)> {
    match config.backend {
        StreamBackend::Memory => {
            let broker = InMemoryBroker::from_config(config);
            let group = broker.consumer_group(config.group.clone());
            Ok((Arc::new(broker), Arc::new(group)))
        }
        #[cfg(feature = "kafka")]
        StreamBackend::Kafka => Ok((
            Arc::new(crate::kafka::KafkaSink::new(config)?),
            Arc::new(crate::kafka::KafkaConsumerGroup::new(config)?),
        )),
        #[cfg(not(feature = "kafka"))]
        StreamBackend::Kafka => Err(PipelineError::config("built without the kafka feature")),
    }
}
