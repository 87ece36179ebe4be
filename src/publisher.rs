//! Partitioned, micro-batching event publisher.
//!
//! `publish` serializes an envelope into a [`Message`] keyed by its `user_id`
//! and hands it to a bounded transport buffer. A background task collects
//! buffered messages for up to `linger` (or until `batch_size` are waiting)
//! and writes them to the [`MessageSink`] in one call. Callers only wait for
//! buffer space, never for the transport.

use bytes::Bytes;
use chrono::Utc;
use eventstore_core::metrics::{Counter, MetricsRegistry};
use eventstore_core::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::broker::{Message, MessageSink};
use crate::config::PublisherConfig;
use crate::error::{PipelineError, Result};

enum Command {
    Publish(Message),
    Flush(oneshot::Sender<()>),
}

pub struct Publisher {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    serialize_errors: Arc<Counter>,
}

impl Publisher {
    /// Spawns the background transport task. Must be called inside a Tokio
    /// runtime.
    pub fn new(sink: Arc<dyn MessageSink>, config: &PublisherConfig, metrics: &MetricsRegistry) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let transport = Transport {
            sink,
            linger: config.linger(),
            batch_size: config.batch_size.max(1),
            sent: metrics.counter("producer.messages.sent"),
            transport_errors: metrics.counter("producer.errors.transport"),
        };

        Self {
            tx,
            task: tokio::spawn(transport.run(rx)),
            serialize_errors: metrics.counter("producer.errors.serialize"),
        }
    }

    fn to_message(event: &mut Event) -> Result<Message> {
        let value = event.to_json()?;
        let produced_at = Utc::now();
        event.delivery.produced_at = Some(produced_at);

        Ok(Message {
            key: Bytes::copy_from_slice(event.user_id.as_bytes()),
            value: Bytes::from(value),
            headers: vec![
                ("event_type".to_string(), Bytes::from_static(event.event_type.as_str().as_bytes())),
                ("project_id".to_string(), Bytes::copy_from_slice(event.project_id.as_bytes())),
            ],
            produced_at,
        })
    }

    async fn enqueue(&self, message: Message) -> Result<()> {
        self.tx
            .send(Command::Publish(message))
            .await
            .map_err(|_| PipelineError::publish("publisher is closed"))
    }

    /// Publishes one envelope and stamps its `produced_at`. Serialization
    /// failures are returned to the caller.
    pub async fn publish(&self, event: &mut Event) -> Result<()> {
        let message = Self::to_message(event).map_err(|e| {
            self.serialize_errors.increment();
            e
        })?;
        self.enqueue(message).await
    }

    /// Publishes every envelope that serializes; the others are logged and
    /// skipped. Returns the number of envelopes handed to the buffer.
    pub async fn publish_batch(&self, events: &mut [Event]) -> Result<usize> {
        let mut published = 0;
        for event in events.iter_mut() {
            match Self::to_message(event) {
                Ok(message) => {
                    self.enqueue(message).await?;
                    published += 1;
                }
                Err(e) => {
                    self.serialize_errors.increment();
                    warn!(event_id = %event.id, error = %e, "Skipping unserializable event");
                }
            }
        }
        Ok(published)
    }

    /// Resolves once every message published before this call has been
    /// passed to the transport.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| PipelineError::publish("publisher is closed"))?;
        done_rx
            .await
            .map_err(|_| PipelineError::publish("publisher task stopped"))
    }

    /// Drains the buffer and stops the background task.
    pub async fn close(self) -> Result<()> {
        let Publisher { tx, task, .. } = self;
        drop(tx);
        task.await
            .map_err(|e| PipelineError::publish(format!("publisher task failed: {}", e)))
    }
}

struct Transport {
    sink: Arc<dyn MessageSink>,
    linger: Duration,
    batch_size: usize,
    sent: Arc<Counter>,
    transport_errors: Arc<Counter>,
}

impl Transport {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut pending = Vec::with_capacity(self.batch_size);
        let mut waiters = Vec::new();

        while let Some(command) = rx.recv().await {
            Self::accept(command, &mut pending, &mut waiters);

            // Linger for companions unless a flush is already waiting.
            let deadline = Instant::now() + self.linger;
            while pending.len() < self.batch_size && waiters.is_empty() {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(command)) => Self::accept(command, &mut pending, &mut waiters),
                    Ok(None) | Err(_) => break,
                }
            }

            self.send(std::mem::take(&mut pending)).await;
            for waiter in waiters.drain(..) {
                let _ = waiter.send(());
            }
        }

        debug!("Publisher transport stopped");
    }

    fn accept(command: Command, pending: &mut Vec<Message>, waiters: &mut Vec<oneshot::Sender<()>>) {
        match command {
            Command::Publish(message) => pending.push(message),
            Command::Flush(waiter) => waiters.push(waiter),
        }
    }

    async fn send(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let count = messages.len() as u64;
        match self.sink.write_messages(messages).await {
            Ok(()) => self.sent.increment_by(count),
            Err(e) => {
                self.transport_errors.increment_by(count);
                error!(messages = count, error = %e, "Failed to write messages to stream");
            }
        }
    }
}
