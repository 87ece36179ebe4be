//! Eventstream binary.
//!
//! # Configuration
//!
//! Configuration can be provided through multiple sources, in order of precedence:
//!
//! 1. Command-line arguments (highest precedence)
//! 2. Environment variables (`EVENTSTREAM__<SECTION>__<KEY>`)
//! 3. User-specified configuration file (via `--config`)
//! 4. System-wide configuration (`/etc/eventstream/config.toml`)
//! 5. Default configuration (embedded in binary)
//!
//! ```text
//! Usage: eventstream [OPTIONS] [COMMAND]
//!
//! Commands:
//!   run        Start the worker pool and consume until interrupted
//!   reprocess  Drain a day's retry list through the normal flush path
//!
//! Options:
//!   -c, --config <FILE>                  Path to the configuration file
//!       --workers <WORKERS>              [env: EVENTSTREAM_WORKERS]
//!       --batch-size <BATCH_SIZE>        [env: EVENTSTREAM_BATCH_SIZE]
//!       --flush-interval-ms <MS>         [env: EVENTSTREAM_FLUSH_INTERVAL_MS]
//!       --partitions <PARTITIONS>        [env: EVENTSTREAM_PARTITIONS]
//!       --store-connection <STR>         [env: EVENTSTREAM_STORE_CONNECTION]
//!       --cache-url <URL>                [env: EVENTSTREAM_CACHE_URL]
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Run with 8 workers and a file-backed store, publishing 10k demo events
//! eventstream --workers 8 --store-connection events.duckdb run --demo-events 10000
//!
//! # Reprocess the retry list of 1 March 2024 parked by an earlier run
//! RUST_LOG=debug eventstream --cache-url redis://127.0.0.1:6379 reprocess --day 20240301
//! ```

use chrono::{TimeDelta, Utc};
use clap::Parser;
use eventstore_core::{EventType, NewEvent};
use eventstream::{CliArgs, Command, Pipeline, Settings};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_USERS: usize = 50;

fn demo_events(count: usize) -> Vec<NewEvent> {
    let now = Utc::now();
    (0..count)
        .map(|i| NewEvent {
            project_id: format!("project-{}", i % 3),
            user_id: format!("user-{}", i % DEMO_USERS),
            event_type: Some(EventType::ALL[i % EventType::ALL.len()]),
            page_url: format!("/page/{}", i % 10),
            metadata: json!({ "sequence": i })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            user_agent: "eventstream-demo".to_string(),
            ip_address: "127.0.0.1".to_string(),
            timestamp: Some(now - TimeDelta::seconds((count - i) as i64)),
            ..Default::default()
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_args = CliArgs::parse();

    // Load settings from config files, environment and CLI args
    let settings = Settings::new(&cli_args)?;
    let pipeline = Pipeline::build(settings).await?;

    match cli_args.command_or_default() {
        Command::Run { demo_events: count } => {
            pipeline.start()?;

            if count > 0 {
                let published = pipeline.service.process_events(demo_events(count)).await?;
                info!(events = published.len(), "Published demo events");
            }

            info!("Pipeline running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;

            pipeline.shutdown().await?;
            info!(
                stored = pipeline.store.count_events().await?,
                unique_users_today = pipeline.processor.realtime().unique_users(Utc::now().date_naive()).await?,
                "Final state"
            );
        }
        Command::Reprocess { day } => {
            let report = pipeline.processor.reprocess(day).await?;
            info!(
                drained = report.drained,
                committed = report.committed,
                retried = report.retried,
                "Reprocessing finished"
            );
        }
    }

    let snapshot = pipeline.metrics.snapshot();
    info!(counters = ?snapshot.counters, "Metrics");
    Ok(())
}
