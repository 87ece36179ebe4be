//! Partitioned message stream between the publisher and the worker pool.
//!
//! The pipeline only depends on the [`MessageSink`], [`ConsumerGroup`] and
//! [`MessageSource`] traits. [`InMemoryBroker`] implements all three in
//! process: every partition is an append-only log, records are routed by a
//! stable hash of their key, and each consumer group keeps committed offsets
//! per partition. Positions are committed on a fixed interval, independent of
//! how the consumer batches its work, so records consumed after the last
//! commit are delivered again to the next member that joins.
//!
//! A group also reports its lag, the records published but not yet fetched
//! by any member, so shutdown can wait until everything in the stream has
//! reached a worker.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{PipelineError, Result};

/// One stream record.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Partitioning key
    pub key: Bytes,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
    pub produced_at: DateTime<Utc>,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// A record together with its position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    pub partition: u32,
    pub offset: i64,
}

/// Producer side of the stream.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn write_messages(&self, messages: Vec<Message>) -> Result<()>;
}

/// Consumer side of the stream, owned by exactly one worker.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Waits up to `wait` for the next record of an assigned partition.
    /// `Ok(None)` means the wait elapsed. Dropping the returned future
    /// before it completes consumes nothing.
    async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>>;

    /// Commits final positions and leaves the group.
    async fn close(&mut self) -> Result<()>;
}

/// Shared subscription that hands out disjoint partition sets.
pub trait ConsumerGroup: Send + Sync + 'static {
    /// Joins as `member` of `members`. The member is assigned every partition
    /// `p` with `p % members == member`.
    fn join(&self, member: usize, members: usize) -> Result<Box<dyn MessageSource>>;

    /// Records in the stream that no member has fetched yet. May block on
    /// network backends.
    fn lag(&self) -> Result<u64>;
}

struct BrokerState {
    partitions: Vec<Vec<Message>>,
    committed: HashMap<(String, u32), i64>,
    /// Next offset a live member will read, per group and partition
    fetched: HashMap<(String, u32), i64>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    appended: Notify,
    commit_interval: Duration,
}

/// In-process partitioned broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new(partitions: u32, commit_interval: Duration) -> Self {
        let partitions = partitions.max(1) as usize;
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    partitions: vec![Vec::new(); partitions],
                    committed: HashMap::new(),
                    fetched: HashMap::new(),
                }),
                appended: Notify::new(),
                commit_interval,
            }),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.partitions, config.commit_interval())
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.state.lock().partitions.len() as u32
    }

    /// Partition a key is routed to. Stable across runs.
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        partition_for(key, self.partition_count())
    }

    /// Next offset of every partition.
    pub fn end_offsets(&self) -> Vec<i64> {
        self.inner
            .state
            .lock()
            .partitions
            .iter()
            .map(|log| log.len() as i64)
            .collect()
    }

    /// Committed offset (next record to read) of a group on a partition.
    pub fn committed(&self, group: &str, partition: u32) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group.to_string(), partition))
            .copied()
    }

    pub fn consumer_group(&self, group: impl Into<String>) -> InMemoryConsumerGroup {
        InMemoryConsumerGroup {
            inner: self.inner.clone(),
            group: group.into(),
        }
    }
}

fn partition_for(key: &[u8], partitions: u32) -> u32 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(key);
    (hasher.finish() % partitions as u64) as u32
}

#[async_trait]
impl MessageSink for InMemoryBroker {
    async fn write_messages(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            let partitions = state.partitions.len() as u32;
            for message in messages {
                let partition = partition_for(&message.key, partitions);
                state.partitions[partition as usize].push(message);
            }
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }
}

pub struct InMemoryConsumerGroup {
    inner: Arc<BrokerInner>,
    group: String,
}

impl ConsumerGroup for InMemoryConsumerGroup {
    fn join(&self, member: usize, members: usize) -> Result<Box<dyn MessageSource>> {
        if members == 0 || member >= members {
            return Err(PipelineError::stream(format!(
                "invalid group member {} of {}",
                member, members
            )));
        }

        let assigned: Vec<(u32, i64)> = {
            let mut state = self.inner.state.lock();
            let assigned: Vec<_> = (0..state.partitions.len() as u32)
                .filter(|p| *p as usize % members == member)
                .map(|p| {
                    let position = state
                        .committed
                        .get(&(self.group.clone(), p))
                        .copied()
                        .unwrap_or(0);
                    (p, position)
                })
                .collect();
            // A new member resumes from the committed position.
            for (partition, position) in &assigned {
                state.fetched.insert((self.group.clone(), *partition), *position);
            }
            assigned
        };

        debug!(
            group = %self.group,
            member,
            partitions = ?assigned.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            "Joined consumer group"
        );

        Ok(Box::new(InMemorySource {
            inner: self.inner.clone(),
            group: self.group.clone(),
            assigned,
            cursor: 0,
            last_commit: Instant::now(),
        }))
    }

    fn lag(&self) -> Result<u64> {
        let state = self.inner.state.lock();
        let lag = state
            .partitions
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                let key = (self.group.clone(), partition as u32);
                let position = state
                    .fetched
                    .get(&key)
                    .or_else(|| state.committed.get(&key))
                    .copied()
                    .unwrap_or(0);
                (log.len() as i64 - position).max(0) as u64
            })
            .sum();
        Ok(lag)
    }
}

struct InMemorySource {
    inner: Arc<BrokerInner>,
    group: String,
    /// (partition, next offset to read)
    assigned: Vec<(u32, i64)>,
    cursor: usize,
    last_commit: Instant,
}

impl InMemorySource {
    /// Takes the next available record, rotating over assigned partitions.
    fn try_take(&mut self) -> Option<Delivery> {
        let mut state = self.inner.state.lock();
        let count = self.assigned.len();

        for step in 0..count {
            let index = (self.cursor + step) % count;
            let (partition, position) = &mut self.assigned[index];
            let Some(message) = state.partitions[*partition as usize]
                .get(*position as usize)
                .cloned()
            else {
                continue;
            };

            let delivery = Delivery {
                message,
                partition: *partition,
                offset: *position,
            };
            *position += 1;
            state
                .fetched
                .insert((self.group.clone(), *partition), *position);
            self.cursor = (index + 1) % count;
            return Some(delivery);
        }
        None
    }

    fn commit(&mut self) {
        let mut state = self.inner.state.lock();
        for (partition, position) in &self.assigned {
            state
                .committed
                .insert((self.group.clone(), *partition), *position);
        }
        self.last_commit = Instant::now();
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        if self.last_commit.elapsed() >= self.inner.commit_interval {
            self.commit();
        }

        let deadline = Instant::now() + wait;
        let inner = self.inner.clone();
        loop {
            // Register interest before looking, so an append in between
            // still wakes us.
            let notified = inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }
}
