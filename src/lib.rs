//! Eventstream: analytics event ingestion pipeline.
//!
//! Events enter through [`EventService::process_event`], are published to a
//! partitioned stream keyed by `user_id`, and are consumed by a fixed pool of
//! workers. Each worker groups envelopes into batches that close on size or
//! age, commits every batch to the columnar store all-or-nothing, then
//! updates real-time aggregates. Batches the store rejects are parked in a
//! day-bucketed retry list for operator-triggered reprocessing.
//!
//! Storage, retry and aggregation live in the `eventstore_core` crate; this
//! crate holds the stream, the worker pool and the publish path.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventstream::{config::Settings, Pipeline};
//! use eventstore_core::NewEvent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::build(Settings::default()).await?;
//!     pipeline.start()?;
//!
//!     let event = pipeline
//!         .service
//!         .process_event(NewEvent {
//!             project_id: "proj-1".to_string(),
//!             user_id: "user-1".to_string(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("published {}", event.id);
//!
//!     pipeline.shutdown().await?;
//!     println!("stored {} events", pipeline.store.count_events().await?);
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod broker;
pub mod config;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod pipeline;
pub mod processor;
pub mod publisher;
pub mod service;
pub mod worker;

#[cfg(test)]
mod tests;

pub use assembler::BatchAssembler;
pub use broker::{ConsumerGroup, Delivery, InMemoryBroker, Message, MessageSink, MessageSource};
pub use config::{CliArgs, Command, Settings, StreamBackend};
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
pub use processor::{BatchProcessor, FlushOutcome, ReprocessReport};
pub use publisher::Publisher;
pub use service::EventService;
pub use worker::{Transition, WorkerPool};
