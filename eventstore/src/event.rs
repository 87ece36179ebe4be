//! Event envelope, batches and their columnar encoding.
//!
//! An [`Event`] is the unit that flows through the whole pipeline: it is
//! serialized onto the message stream, grouped into a [`Batch`] by a worker,
//! committed to the columnar store and finally counted by the real-time
//! aggregator. Delivery metadata rides along with the envelope in memory but
//! is never part of its serialized form.

use arrow_array::{ArrayRef, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;

/// Closed set of event kinds accepted by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[default]
    #[serde(alias = "")]
    PageView,
    ButtonClick,
    FormSubmit,
    Purchase,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::PageView,
        EventType::ButtonClick,
        EventType::FormSubmit,
        EventType::Purchase,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::ButtonClick => "button_click",
            EventType::FormSubmit => "form_submit",
            EventType::Purchase => "purchase",
            EventType::Custom => "custom",
        }
    }

    /// Parses the wire name of an event type. The empty string maps to
    /// `page_view`, matching the envelope default.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "" | "page_view" => Some(EventType::PageView),
            "button_click" => Some(EventType::ButtonClick),
            "form_submit" => Some(EventType::FormSubmit),
            "purchase" => Some(EventType::Purchase),
            "custom" => Some(EventType::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream-assigned fields. Populated by the publisher and the consuming
/// worker, never by the producing side, and never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryMetadata {
    pub partition: Option<u32>,
    pub offset: Option<i64>,
    pub produced_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// One analytics event plus its delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub ip_address: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub delivery: DeliveryMetadata,
}

impl Event {
    /// Decodes an envelope from its JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the envelope without its delivery metadata.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// An event as handed over by the producing boundary, before defaults
/// are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewEvent {
    /// Applies the envelope defaults: a fresh UUID when the id is missing or
    /// empty, `page_view` when no type is given and `now` when no timestamp is.
    pub fn normalize(self, now: DateTime<Utc>) -> Event {
        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };

        Event {
            id,
            project_id: self.project_id,
            user_id: self.user_id,
            event_type: self.event_type.unwrap_or_default(),
            page_url: self.page_url,
            metadata: self.metadata,
            user_agent: self.user_agent,
            ip_address: self.ip_address,
            timestamp: self.timestamp.unwrap_or(now),
            delivery: DeliveryMetadata::default(),
        }
    }
}

/// A closed, ordered group of envelopes committed as one unit.
#[derive(Debug, Clone)]
pub struct Batch {
    events: Vec<Event>,
    opened_at: Instant,
}

impl Batch {
    pub fn new(events: Vec<Event>, opened_at: Instant) -> Self {
        Self { events, opened_at }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Instant the first envelope entered the batch.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

/// Gets the schema for stored events in Arrow format.
pub fn get_events_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("project_id", DataType::Utf8, false),
        Field::new("user_id", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("page_url", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("user_agent", DataType::Utf8, false),
        Field::new("ip_address", DataType::Utf8, false),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ])
}

/// Creates a RecordBatch from the envelopes of a batch. Metadata is
/// stored as JSON text.
pub fn create_record_batch(events: &[Event]) -> Result<RecordBatch> {
    let schema = get_events_schema();

    let metadata = events
        .iter()
        .map(|e| serde_json::to_string(&e.metadata))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let ids = StringArray::from_iter_values(events.iter().map(|e| e.id.as_str()));
    let projects = StringArray::from_iter_values(events.iter().map(|e| e.project_id.as_str()));
    let users = StringArray::from_iter_values(events.iter().map(|e| e.user_id.as_str()));
    let types = StringArray::from_iter_values(events.iter().map(|e| e.event_type.as_str()));
    let pages = StringArray::from_iter_values(events.iter().map(|e| e.page_url.as_str()));
    let metadata = StringArray::from_iter_values(metadata.iter().map(|m| m.as_str()));
    let agents = StringArray::from_iter_values(events.iter().map(|e| e.user_agent.as_str()));
    let ips = StringArray::from_iter_values(events.iter().map(|e| e.ip_address.as_str()));
    let timestamps =
        TimestampMicrosecondArray::from_iter_values(events.iter().map(|e| e.timestamp.timestamp_micros()))
            .with_timezone("UTC");

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(ids),
        Arc::new(projects),
        Arc::new(users),
        Arc::new(types),
        Arc::new(pages),
        Arc::new(metadata),
        Arc::new(agents),
        Arc::new(ips),
        Arc::new(timestamps),
    ];

    Ok(RecordBatch::try_new(Arc::new(schema), arrays)?)
}
