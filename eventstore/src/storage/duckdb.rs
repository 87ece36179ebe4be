//! DuckDB columnar event store.
//!
//! This module provides the source-of-truth store for envelopes using DuckDB,
//! an embedded analytical database. The implementation supports:
//! - In-memory and persistent storage options
//! - A small pool of connections to one database, shared by all workers
//! - All-or-nothing batch commits: one transaction and one prepared
//!   statement per batch
//! - `metadata` kept in a `JSON` column, queryable with DuckDB's JSON
//!   functions
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! connection = ":memory:"  # Use ":memory:" for in-memory or file path
//! pool_size = 4
//! threads = 2              # Optional
//! ```
//!
//! Batches are first encoded into an Arrow `RecordBatch` (see
//! [`create_record_batch`]) and the rows are bound from those columns.

use arrow_array::{Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{params, Config, Connection};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::event::{create_record_batch, Batch, DeliveryMetadata, Event, EventType};
use crate::storage::BulkWriter;

const CREATE_EVENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id VARCHAR NOT NULL CHECK (id <> ''),
        project_id VARCHAR NOT NULL,
        user_id VARCHAR NOT NULL,
        event_type VARCHAR NOT NULL,
        page_url VARCHAR NOT NULL,
        metadata JSON NOT NULL,
        user_agent VARCHAR NOT NULL,
        ip_address VARCHAR NOT NULL,
        timestamp TIMESTAMP NOT NULL
    );
"#;

const INSERT_EVENT: &str = r#"
    INSERT INTO events (
        id, project_id, user_id, event_type, page_url,
        metadata, user_agent, ip_address, timestamp
    ) VALUES (?, ?, ?, ?, ?, CAST(? AS JSON), ?, ?, CAST(? AS TIMESTAMP))
"#;

const SELECT_EVENTS: &str = "SELECT id, project_id, user_id, event_type, page_url, CAST(metadata AS VARCHAR), \
     user_agent, ip_address, CAST(timestamp AS VARCHAR) FROM events";

/// Round-robin pool of connections to a single DuckDB database.
struct ConnectionPool {
    connections: Vec<Arc<Mutex<Connection>>>,
    next: AtomicUsize,
}

impl ConnectionPool {
    fn new(primary: Connection, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 1..size {
            connections.push(Arc::new(Mutex::new(primary.try_clone()?)));
        }
        connections.push(Arc::new(Mutex::new(primary)));

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    fn get(&self) -> Arc<Mutex<Connection>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}

/// DuckDB-based columnar store for envelopes.
#[derive(Clone)]
pub struct DuckDbEventStore {
    pool: Arc<ConnectionPool>,
}

impl DuckDbEventStore {
    /// Opens (or creates) the database and ensures the `events` table exists.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let mut db_config = Config::default();
        if let Some(threads) = config.threads {
            db_config = db_config.threads(threads as i64)?;
        }

        let conn = if config.connection == ":memory:" {
            Connection::open_in_memory_with_flags(db_config)?
        } else {
            Connection::open_with_flags(&config.connection, db_config)?
        };
        conn.execute_batch(CREATE_EVENTS_TABLE)?;

        info!(
            connection = %config.connection,
            pool_size = config.pool_size,
            "DuckDB event store ready"
        );

        Ok(Self {
            pool: Arc::new(ConnectionPool::new(conn, config.pool_size)?),
        })
    }

    /// Creates a new event store with an in-memory database.
    pub fn new_in_memory() -> Result<Self> {
        Self::open(&StoreConfig::default())
    }

    /// Inserts every row of `records` inside one transaction. Any failure
    /// drops the transaction, which rolls back the rows bound so far.
    fn insert_record_batch(conn: &mut Connection, records: &RecordBatch) -> Result<()> {
        let mut strings = Vec::with_capacity(8);
        for name in ["id", "project_id", "user_id", "event_type", "page_url", "metadata", "user_agent", "ip_address"] {
            let column = records
                .column_by_name(name)
                .and_then(|col| col.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| StoreError::store(format!("Invalid {} column", name)))?;
            strings.push(column);
        }
        let timestamps = records
            .column_by_name("timestamp")
            .and_then(|col| col.as_any().downcast_ref::<TimestampMicrosecondArray>())
            .ok_or_else(|| StoreError::store("Invalid timestamp column"))?;

        // Begin transaction
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_EVENT)?;
            for i in 0..records.num_rows() {
                let timestamp = DateTime::from_timestamp_micros(timestamps.value(i))
                    .ok_or_else(|| StoreError::store("Timestamp out of range"))?
                    .format("%Y-%m-%d %H:%M:%S%.6f")
                    .to_string();

                stmt.execute(params![
                    strings[0].value(i),
                    strings[1].value(i),
                    strings[2].value(i),
                    strings[3].value(i),
                    strings[4].value(i),
                    strings[5].value(i),
                    strings[6].value(i),
                    strings[7].value(i),
                    timestamp,
                ])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    /// Runs a blocking closure on a pooled connection.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.pool.get();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::store(format!("Store task failed: {}", e)))?
    }

    /// Number of persisted envelopes.
    pub async fn count_events(&self) -> Result<u64> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", params![], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Extracts one metadata value of a stored envelope as text, `None` when
    /// the envelope or the path is missing. `path` is a JSONPath such as
    /// `$.plan` or `$.items[0].sku`.
    pub async fn metadata_value(&self, id: &str, path: &str) -> Result<Option<String>> {
        let (id, path) = (id.to_string(), path.to_string());
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare("SELECT json_extract_string(metadata, ?) FROM events WHERE id = ?")?;
            let mut rows = stmt.query(params![path, id])?;
            match rows.next()? {
                Some(row) => Ok(row.get::<_, Option<String>>(0)?),
                None => Ok(None),
            }
        })
        .await
    }

    /// Envelopes of one user in commit order.
    pub async fn events_for_user(&self, user_id: &str) -> Result<Vec<Event>> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let sql = format!("{} WHERE user_id = ? ORDER BY rowid ASC", SELECT_EVENTS);
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![user_id])?;

            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                let event_type: String = row.get(3)?;
                let metadata: String = row.get(5)?;
                let timestamp: String = row.get(8)?;

                events.push(Event {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    user_id: row.get(2)?,
                    event_type: EventType::parse(&event_type)
                        .ok_or_else(|| StoreError::store(format!("Unknown event type {}", event_type)))?,
                    page_url: row.get(4)?,
                    metadata: serde_json::from_str::<Map<String, Value>>(&metadata)?,
                    user_agent: row.get(6)?,
                    ip_address: row.get(7)?,
                    timestamp: parse_timestamp(&timestamp)?,
                    delivery: DeliveryMetadata::default(),
                });
            }
            Ok(events)
        })
        .await
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::store(format!("Invalid timestamp {}: {}", value, e)))
}

#[async_trait]
impl BulkWriter for DuckDbEventStore {
    async fn commit(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let records = create_record_batch(batch.events())?;
        let rows = records.num_rows();
        self.with_connection(move |conn| Self::insert_record_batch(conn, &records))
            .await?;

        debug!(rows, "Committed batch to DuckDB");
        Ok(())
    }
}
