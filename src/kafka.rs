//! Kafka-backed message stream, built with the `kafka` feature.
//!
//! [`KafkaSink`] produces keyed records, so Kafka's default partitioner keeps
//! each user on one partition. [`KafkaConsumerGroup`] gives every worker its
//! own consumer in the configured group. Kafka's group coordinator, not the
//! member index, decides which partitions each consumer reads. Offsets are
//! stored as records are fetched and committed every
//! `stream.commit_interval_ms`, the same contract as the in-process broker.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{ConsumerGroup, Delivery, Message, MessageSink, MessageSource};
use crate::config::StreamConfig;
use crate::error::{PipelineError, Result};

/// Bound on metadata, watermark, commit and enqueue calls.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

impl From<KafkaError> for PipelineError {
    fn from(err: KafkaError) -> Self {
        Self::Stream(err.to_string())
    }
}

/// Producer side. A write returns once every record is acknowledged.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaSink {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "30000")
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()?;

        info!(brokers = %config.brokers, topic = %config.topic, "Kafka producer created");
        Ok(Self {
            producer,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn write_messages(&self, messages: Vec<Message>) -> Result<()> {
        let deliveries = messages.iter().map(|message| {
            let headers = message
                .headers
                .iter()
                .fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key: key.as_str(),
                        value: Some(&value[..]),
                    })
                });
            let record = FutureRecord::to(&self.topic)
                .key(&message.key[..])
                .payload(&message.value[..])
                .headers(headers)
                .timestamp(message.produced_at.timestamp_millis());
            self.producer.send(record, CLIENT_TIMEOUT)
        });

        for result in join_all(deliveries).await {
            result.map_err(|(e, _)| PipelineError::from(e))?;
        }
        Ok(())
    }
}

fn consumer_config(config: &StreamConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group)
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", config.commit_interval_ms.to_string())
        .set("auto.offset.reset", "earliest");
    client
}

/// Consumer group over one topic.
pub struct KafkaConsumerGroup {
    config: StreamConfig,
    /// Next offset to read per partition, written by every member
    fetched: Arc<Mutex<HashMap<i32, i64>>>,
    /// Reads watermarks and committed offsets; never subscribes
    admin: BaseConsumer,
}

impl KafkaConsumerGroup {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            fetched: Arc::new(Mutex::new(HashMap::new())),
            admin: consumer_config(config).create()?,
        })
    }

    fn committed_positions(&self, partitions: &[i32]) -> Result<HashMap<i32, i64>> {
        let mut assignment = TopicPartitionList::new();
        for partition in partitions {
            assignment.add_partition(&self.config.topic, *partition);
        }
        let committed = self.admin.committed_offsets(assignment, CLIENT_TIMEOUT)?;

        Ok(committed
            .elements()
            .iter()
            .filter_map(|entry| match entry.offset() {
                Offset::Offset(offset) => Some((entry.partition(), offset)),
                _ => None,
            })
            .collect())
    }
}

impl ConsumerGroup for KafkaConsumerGroup {
    fn join(&self, member: usize, members: usize) -> Result<Box<dyn MessageSource>> {
        if members == 0 || member >= members {
            return Err(PipelineError::stream(format!(
                "invalid group member {} of {}",
                member, members
            )));
        }

        let consumer: StreamConsumer = consumer_config(&self.config).create()?;
        consumer.subscribe(&[self.config.topic.as_str()])?;
        debug!(group = %self.config.group, topic = %self.config.topic, member, "Joined Kafka consumer group");

        Ok(Box::new(KafkaSource {
            consumer,
            fetched: self.fetched.clone(),
        }))
    }

    fn lag(&self) -> Result<u64> {
        let metadata = self
            .admin
            .fetch_metadata(Some(&self.config.topic), CLIENT_TIMEOUT)?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|topic| topic.name() == self.config.topic)
            .flat_map(|topic| topic.partitions().iter().map(|p| p.id()))
            .collect();

        let committed = self.committed_positions(&partitions)?;
        let fetched = self.fetched.lock().clone();

        let mut lag = 0;
        for partition in partitions {
            let (low, high) = self
                .admin
                .fetch_watermarks(&self.config.topic, partition, CLIENT_TIMEOUT)?;
            let position = fetched
                .get(&partition)
                .or_else(|| committed.get(&partition))
                .copied()
                .unwrap_or(low);
            lag += (high - position).max(0) as u64;
        }
        Ok(lag)
    }
}

struct KafkaSource {
    consumer: StreamConsumer,
    fetched: Arc<Mutex<HashMap<i32, i64>>>,
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        let record = match tokio::time::timeout(wait, self.consumer.recv()).await {
            Ok(record) => record?,
            Err(_) => return Ok(None),
        };

        let headers = record
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        let value = header.value.map(Bytes::copy_from_slice).unwrap_or_default();
                        (header.key.to_string(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let produced_at = record
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let delivery = Delivery {
            message: Message {
                key: record.key().map(Bytes::copy_from_slice).unwrap_or_default(),
                value: record.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
                headers,
                produced_at,
            },
            partition: record.partition() as u32,
            offset: record.offset(),
        };
        self.fetched
            .lock()
            .insert(record.partition(), record.offset() + 1);
        Ok(Some(delivery))
    }

    async fn close(&mut self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            // Nothing was fetched since the last commit.
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => return Err(e.into()),
        }
        self.consumer.unsubscribe();
        Ok(())
    }
}
