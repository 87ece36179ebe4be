//! Configuration management for the ingestion pipeline.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/eventstream/config.toml`)
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables (prefixed with `EVENTSTREAM__`, `__` between
//!    section and key, e.g. `EVENTSTREAM__CONSUMER__WORKERS=8`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::{Config, ConfigError};
use eventstore_core::aggregation::parse_retry_day;
use eventstore_core::config::{CacheConfig, StoreConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/eventstream/config.toml";

/// Command-line arguments parser.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Number of workers in the pool
    #[arg(long, env = "EVENTSTREAM_WORKERS", global = true)]
    pub workers: Option<usize>,

    /// Maximum envelopes per batch
    #[arg(long, env = "EVENTSTREAM_BATCH_SIZE", global = true)]
    pub batch_size: Option<usize>,

    /// Maximum age of a non-empty batch in milliseconds
    #[arg(long, env = "EVENTSTREAM_FLUSH_INTERVAL_MS", global = true)]
    pub flush_interval_ms: Option<u64>,

    /// Number of stream partitions
    #[arg(long, env = "EVENTSTREAM_PARTITIONS", global = true)]
    pub partitions: Option<u32>,

    /// Columnar store connection string (":memory:" or a file path)
    #[arg(long, env = "EVENTSTREAM_STORE_CONNECTION", global = true)]
    pub store_connection: Option<String>,

    /// Redis server for retry lists and aggregates
    #[arg(long, env = "EVENTSTREAM_CACHE_URL", global = true)]
    pub cache_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the worker pool and consume until interrupted
    Run {
        /// Publish this many synthetic events after startup
        #[arg(long, default_value_t = 0)]
        demo_events: usize,
    },
    /// Drain a day's retry list through the normal flush path
    Reprocess {
        /// Retry day as YYYYMMDD
        #[arg(long, value_parser = parse_day)]
        day: NaiveDate,
    },
}

fn parse_day(value: &str) -> std::result::Result<NaiveDate, String> {
    parse_retry_day(value).ok_or_else(|| format!("expected YYYYMMDD, got {}", value))
}

impl CliArgs {
    /// The subcommand to run, `run` when none was given.
    pub fn command_or_default(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { demo_events: 0 })
    }
}

/// Where the message stream lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamBackend {
    /// In-process partitioned log
    Memory,
    /// Kafka topic, available with the `kafka` feature
    Kafka,
}

/// Message stream configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub backend: StreamBackend,
    /// Partition count of the in-process log. Kafka topics keep their own.
    pub partitions: u32,
    /// Consumer group shared by all workers
    pub group: String,
    /// Interval between automatic offset commits
    pub commit_interval_ms: u64,
    /// How long shutdown waits for the workers to read the whole stream
    pub drain_timeout_ms: u64,
    /// Kafka bootstrap servers
    pub brokers: String,
    /// Kafka topic carrying the events
    pub topic: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend: StreamBackend::Memory,
            partitions: 8,
            group: "event-consumers".to_string(),
            commit_interval_ms: 1000,
            drain_timeout_ms: 30_000,
            brokers: "localhost:9092".to_string(),
            topic: "events".to_string(),
        }
    }
}

impl StreamConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(PipelineError::config("stream.partitions must be at least 1"));
        }
        if self.backend == StreamBackend::Kafka {
            if !cfg!(feature = "kafka") {
                return Err(PipelineError::config(
                    "stream.backend = \"kafka\" requires the kafka feature",
                ));
            }
            if self.brokers.is_empty() || self.topic.is_empty() {
                return Err(PipelineError::config("stream.brokers and stream.topic are required for kafka"));
            }
        }
        Ok(())
    }
}

/// Worker pool and batching configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Bounded wait of a single fetch
    pub fetch_wait_ms: u64,
    /// Deadline of a single bulk commit
    pub commit_deadline_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            batch_size: 100,
            flush_interval_ms: 100,
            fetch_wait_ms: 5000,
            commit_deadline_ms: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    pub fn commit_deadline(&self) -> Duration {
        Duration::from_millis(self.commit_deadline_ms)
    }
}

/// Publisher micro-batching configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// How long the first buffered message waits for companions
    pub linger_ms: u64,
    pub batch_size: usize,
    /// Capacity of the transport buffer; `publish` waits when it is full
    pub buffer_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            linger_ms: 10,
            batch_size: 100,
            buffer_size: 10_000,
        }
    }
}

impl PublisherConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub stream: StreamConfig,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: &CliArgs) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load default configuration
        builder = builder.add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        // Load system configuration if it exists
        if let Ok(metadata) = std::fs::metadata(DEFAULT_CONFIG_PATH) {
            if metadata.is_file() {
                builder = builder.add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
            }
        }

        // Load user configuration if specified
        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        // Add environment variables (EVENTSTREAM__SECTION__KEY)
        builder = builder.add_source(config::Environment::with_prefix("EVENTSTREAM").separator("__"));

        // Override with command line arguments
        if let Some(workers) = cli.workers {
            builder = builder.set_override("consumer.workers", workers as u64)?;
        }
        if let Some(batch_size) = cli.batch_size {
            builder = builder.set_override("consumer.batch_size", batch_size as u64)?;
        }
        if let Some(flush_interval_ms) = cli.flush_interval_ms {
            builder = builder.set_override("consumer.flush_interval_ms", flush_interval_ms)?;
        }
        if let Some(partitions) = cli.partitions {
            builder = builder.set_override("stream.partitions", partitions as u64)?;
        }
        if let Some(ref connection) = cli.store_connection {
            builder = builder.set_override("store.connection", connection.as_str())?;
        }
        if let Some(ref url) = cli.cache_url {
            builder = builder.set_override("cache.url", url.as_str())?;
        }

        builder.build()?.try_deserialize()
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;
        if self.consumer.workers == 0 {
            return Err(PipelineError::config("consumer.workers must be at least 1"));
        }
        if self.consumer.batch_size == 0 || self.publisher.batch_size == 0 {
            return Err(PipelineError::config("batch sizes must be at least 1"));
        }
        if self.consumer.flush_interval_ms == 0 {
            return Err(PipelineError::config("consumer.flush_interval_ms must be positive"));
        }
        if self.publisher.buffer_size == 0 {
            return Err(PipelineError::config("publisher.buffer_size must be at least 1"));
        }
        self.store.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}
