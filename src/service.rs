//! Inbound boundary of the pipeline.
//!
//! Request handling, authentication and project lookups happen upstream;
//! this service only applies envelope defaults and publishes.

use chrono::Utc;
use eventstore_core::metrics::{Counter, MetricsRegistry};
use eventstore_core::{Event, NewEvent};
use std::sync::Arc;

use crate::error::Result;
use crate::publisher::Publisher;

pub struct EventService {
    publisher: Arc<Publisher>,
    received: Arc<Counter>,
    producer_errors: Arc<Counter>,
}

impl EventService {
    pub fn new(publisher: Arc<Publisher>, metrics: &MetricsRegistry) -> Self {
        Self {
            publisher,
            received: metrics.counter("events.received"),
            producer_errors: metrics.counter("event.producer.errors"),
        }
    }

    /// Normalizes and publishes one event, returning the envelope as sent.
    /// Only published events count as received.
    pub async fn process_event(&self, event: NewEvent) -> Result<Event> {
        let mut event = event.normalize(Utc::now());

        if let Err(e) = self.publisher.publish(&mut event).await {
            self.producer_errors.increment();
            return Err(e);
        }
        self.received.increment();
        Ok(event)
    }

    /// Normalizes every event and publishes them through the batch path.
    pub async fn process_events(&self, events: Vec<NewEvent>) -> Result<Vec<Event>> {
        let now = Utc::now();
        let mut events: Vec<Event> = events.into_iter().map(|e| e.normalize(now)).collect();

        match self.publisher.publish_batch(&mut events).await {
            Ok(published) => {
                self.received.increment_by(published as u64);
                Ok(events)
            }
            Err(e) => {
                self.producer_errors.increment();
                Err(e)
            }
        }
    }
}
