use crate::broker::{ConsumerGroup, Delivery, InMemoryBroker, Message, MessageSink, MessageSource};
use crate::config::{ConsumerConfig, PublisherConfig, Settings};
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::processor::{BatchProcessor, FlushOutcome};
use crate::publisher::Publisher;
use crate::worker::WorkerPool;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use eventstore_core::aggregation::failed_events_key;
use eventstore_core::config::CacheConfig;
use eventstore_core::metrics::MetricsRegistry;
use eventstore_core::{
    Batch, BulkWriter, CacheStore, Event, EventType, MemoryCacheStore, NewEvent, RedisCacheStore,
    StoreError,
};
use mockall::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type StoreResult<T> = eventstore_core::Result<T>;

mock! {
    pub Writer {}
    #[async_trait]
    impl BulkWriter for Writer {
        async fn commit(&self, batch: &Batch) -> StoreResult<()>;
    }
}

mock! {
    pub Cache {}
    #[async_trait]
    impl CacheStore for Cache {
        async fn rpush(&self, key: &str, values: Vec<String>) -> StoreResult<usize>;
        async fn lrange(&self, key: &str) -> StoreResult<Vec<String>>;
        async fn take_list(&self, key: &str) -> StoreResult<Vec<String>>;
        async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;
        async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, i64>>;
        async fn pfadd(&self, key: &str, members: &[String]) -> StoreResult<bool>;
        async fn pfcount(&self, key: &str) -> StoreResult<u64>;
        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
        async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;
    }
}

mock! {
    pub Source {}
    #[async_trait]
    impl MessageSource for Source {
        async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>>;
        async fn close(&mut self) -> Result<()>;
    }
}

/// Hands out one prepared source to the first member that joins.
struct SingleSourceGroup(Mutex<Option<Box<dyn MessageSource>>>);

impl ConsumerGroup for SingleSourceGroup {
    fn join(&self, _member: usize, _members: usize) -> Result<Box<dyn MessageSource>> {
        self.0
            .lock()
            .take()
            .ok_or_else(|| PipelineError::stream("source already taken"))
    }

    fn lag(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Commit-time and envelope ids of every commit, in commit order.
type CommitLog = Arc<Mutex<Vec<(Instant, Vec<String>)>>>;

fn recording_writer(log: CommitLog) -> MockWriter {
    let mut writer = MockWriter::new();
    writer.expect_commit().returning(move |batch| {
        let ids = batch.events().iter().map(|e| e.id.clone()).collect();
        log.lock().push((Instant::now(), ids));
        Ok(())
    });
    writer
}

/// Never finishes within any reasonable deadline.
struct StalledWriter;

#[async_trait]
impl BulkWriter for StalledWriter {
    async fn commit(&self, _batch: &Batch) -> StoreResult<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

fn event(id: &str, user: &str) -> Event {
    NewEvent {
        id: Some(id.to_string()),
        project_id: "proj".to_string(),
        user_id: user.to_string(),
        ..Default::default()
    }
    .normalize(Utc::now())
}

fn message(event: &Event) -> Message {
    Message {
        key: Bytes::copy_from_slice(event.user_id.as_bytes()),
        value: Bytes::from(event.to_json().unwrap()),
        headers: Vec::new(),
        produced_at: Utc::now(),
    }
}

fn batch(n: usize) -> Batch {
    let events = (0..n).map(|i| event(&format!("e{}", i), "u")).collect();
    Batch::new(events, std::time::Instant::now())
}

fn consumer_config(batch_size: usize, flush_interval: Duration) -> ConsumerConfig {
    ConsumerConfig {
        workers: 1,
        batch_size,
        flush_interval_ms: flush_interval.as_millis() as u64,
        fetch_wait_ms: 5000,
        commit_deadline_ms: 10_000,
    }
}

fn batch_processor(
    writer: impl BulkWriter,
    cache: Arc<dyn CacheStore>,
    config: &ConsumerConfig,
    metrics: &MetricsRegistry,
) -> Arc<BatchProcessor> {
    Arc::new(BatchProcessor::new(
        Arc::new(writer),
        cache,
        config,
        &CacheConfig::default(),
        metrics,
    ))
}

fn worker_pool(
    writer: impl BulkWriter,
    group: Arc<dyn ConsumerGroup>,
    config: ConsumerConfig,
) -> (WorkerPool, Arc<MetricsRegistry>) {
    let metrics = Arc::new(MetricsRegistry::new());
    let cache = Arc::new(MemoryCacheStore::default());
    let processor = batch_processor(writer, cache, &config, &metrics);
    (WorkerPool::new(group, processor, config, metrics.clone()), metrics)
}

async fn wait_for_received(metrics: &MetricsRegistry, n: u64) {
    while metrics.counter_value("consumer.events.received") < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_size_triggered_flush_does_not_wait_for_timer() {
    let broker = InMemoryBroker::new(4, Duration::from_secs(1));
    let messages = (0..250).map(|i| message(&event(&format!("e{}", i), "u"))).collect();
    broker.write_messages(messages).await.unwrap();

    let log = CommitLog::default();
    let flush_interval = Duration::from_millis(100);
    let (pool, metrics) = worker_pool(
        recording_writer(log.clone()),
        Arc::new(broker.consumer_group("g")),
        consumer_config(100, flush_interval),
    );

    let start = Instant::now();
    pool.start(1).unwrap();
    wait_for_received(&metrics, 250).await;

    {
        let log = log.lock();
        assert!(log.len() >= 2, "expected two size flushes, got {}", log.len());
        for (at, ids) in log.iter().take(2) {
            assert_eq!(ids.len(), 100);
            assert!(at.duration_since(start) < flush_interval);
        }
    }

    // The remainder goes out on the next tick.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.stop().await.unwrap(), 1);

    let sizes: Vec<_> = log.lock().iter().map(|(_, ids)| ids.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(metrics.counter_value("consumer.events.processed"), 250);
}

#[tokio::test(start_paused = true)]
async fn test_time_triggered_flush_with_idle_stream() {
    let broker = InMemoryBroker::new(4, Duration::from_secs(1));
    let log = CommitLog::default();
    let flush_interval = Duration::from_millis(100);
    let (pool, _metrics) = worker_pool(
        recording_writer(log.clone()),
        Arc::new(broker.consumer_group("g")),
        consumer_config(100, flush_interval),
    );

    let start = Instant::now();
    pool.start(1).unwrap();
    let messages = (0..3).map(|i| message(&event(&format!("e{}", i), "u"))).collect();
    broker.write_messages(messages).await.unwrap();

    // Well below the 5s fetch wait.
    tokio::time::sleep(Duration::from_millis(250)).await;

    {
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, vec!["e0", "e1", "e2"]);
        assert!(log[0].0.duration_since(start) <= flush_interval + Duration::from_millis(1));
    }
    assert_eq!(pool.stop().await.unwrap(), 1);
    assert_eq!(log.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_message_is_dropped() {
    let broker = InMemoryBroker::new(1, Duration::from_secs(1));
    let garbage = Message {
        key: Bytes::from_static(b"u"),
        value: Bytes::from_static(b"{not json"),
        headers: Vec::new(),
        produced_at: Utc::now(),
    };
    broker
        .write_messages(vec![message(&event("e1", "u")), garbage, message(&event("e2", "u"))])
        .await
        .unwrap();

    let log = CommitLog::default();
    let (pool, metrics) = worker_pool(
        recording_writer(log.clone()),
        Arc::new(broker.consumer_group("g")),
        consumer_config(100, Duration::from_millis(100)),
    );
    pool.start(1).unwrap();
    wait_for_received(&metrics, 3).await;
    pool.stop().await.unwrap();

    let ids: Vec<_> = log.lock().iter().flat_map(|(_, ids)| ids.clone()).collect();
    assert_eq!(ids, vec!["e1", "e2"]);
    assert_eq!(metrics.counter_value("consumer.errors.unmarshal"), 1);
    assert_eq!(metrics.counter_value("consumer.events.processed"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_flushes_partial_batch_exactly_once() {
    let broker = InMemoryBroker::new(2, Duration::from_secs(1));
    let messages = (0..37).map(|i| message(&event(&format!("e{}", i), "u"))).collect();
    broker.write_messages(messages).await.unwrap();

    let mut writer = MockWriter::new();
    writer
        .expect_commit()
        .withf(|batch: &Batch| batch.len() == 37)
        .times(1)
        .returning(|_| Ok(()));

    let (pool, metrics) = worker_pool(
        writer,
        Arc::new(broker.consumer_group("g")),
        consumer_config(100, Duration::from_secs(3600)),
    );
    pool.start(1).unwrap();
    wait_for_received(&metrics, 37).await;

    assert_eq!(pool.stop().await.unwrap(), 1);
    assert_eq!(metrics.counter_value("consumer.events.processed"), 37);
    assert!(!pool.is_running());
    // Final positions were committed on the way out.
    assert_eq!(
        broker.committed("g", 0).unwrap_or(0) + broker.committed("g", 1).unwrap_or(0),
        37
    );
}

#[tokio::test(start_paused = true)]
async fn test_per_user_order_is_preserved() {
    let broker = InMemoryBroker::new(8, Duration::from_secs(1));
    let metrics = MetricsRegistry::new();
    let publisher = Publisher::new(Arc::new(broker.clone()), &PublisherConfig::default(), &metrics);

    let mut events = Vec::new();
    for i in 0..30 {
        for user in ["alice", "bob", "carol"] {
            events.push(event(&format!("{}-{:02}", user, i), user));
        }
    }
    publisher.publish_batch(&mut events).await.unwrap();
    publisher.flush().await.unwrap();

    let log = CommitLog::default();
    let mut config = consumer_config(4, Duration::from_millis(100));
    config.workers = 3;
    let (pool, pool_metrics) = worker_pool(recording_writer(log.clone()), Arc::new(broker.consumer_group("g")), config);
    pool.start(3).unwrap();
    wait_for_received(&pool_metrics, 90).await;
    pool.stop().await.unwrap();

    let committed: Vec<String> = log.lock().iter().flat_map(|(_, ids)| ids.clone()).collect();
    assert_eq!(committed.len(), 90);
    for user in ["alice", "bob", "carol"] {
        let ids: Vec<_> = committed.iter().filter(|id| id.starts_with(user)).cloned().collect();
        let expected: Vec<_> = (0..30).map(|i| format!("{}-{:02}", user, i)).collect();
        assert_eq!(ids, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_fetch_errors_do_not_stop_the_worker() {
    let mut source = MockSource::new();
    source
        .expect_fetch()
        .returning(|_| Err(PipelineError::stream("broker unavailable")));
    source.expect_close().times(1).returning(|| Ok(()));

    let group = Arc::new(SingleSourceGroup(Mutex::new(Some(Box::new(source)))));
    let (pool, metrics) = worker_pool(MockWriter::new(), group, consumer_config(100, Duration::from_millis(100)));
    pool.start(1).unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(metrics.counter_value("consumer.errors.fetch") >= 3);
    assert_eq!(pool.stop().await.unwrap(), 1);
}

#[tokio::test]
async fn test_pool_lifecycle_errors() {
    let broker = InMemoryBroker::new(2, Duration::from_secs(1));
    let (pool, _) = worker_pool(
        MockWriter::new(),
        Arc::new(broker.consumer_group("g")),
        consumer_config(10, Duration::from_millis(100)),
    );

    assert!(matches!(pool.stop().await, Err(PipelineError::NotStarted)));
    assert!(matches!(pool.start(0), Err(PipelineError::Config(_))));
    tokio_test::assert_ok!(pool.start(2));
    assert!(matches!(pool.start(2), Err(PipelineError::AlreadyStarted)));
    assert_eq!(pool.stop().await.unwrap(), 2);
}

#[tokio::test]
async fn test_zero_flush_interval_is_rejected() {
    let broker = InMemoryBroker::new(2, Duration::from_secs(1));
    let (pool, _) = worker_pool(
        MockWriter::new(),
        Arc::new(broker.consumer_group("g")),
        consumer_config(10, Duration::ZERO),
    );

    assert!(matches!(pool.start(1), Err(PipelineError::Config(_))));
    assert!(!pool.is_running());
    assert!(matches!(pool.stop().await, Err(PipelineError::NotStarted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_waits_until_stream_is_read() {
    let broker = InMemoryBroker::new(4, Duration::from_secs(1));
    let group = Arc::new(broker.consumer_group("g"));
    let log = CommitLog::default();
    let (pool, metrics) = worker_pool(
        recording_writer(log.clone()),
        group.clone(),
        consumer_config(100, Duration::from_millis(100)),
    );
    assert!(matches!(pool.drain(Duration::from_secs(1)).await, Err(PipelineError::NotStarted)));

    pool.start(3).unwrap();
    let messages = (0..2000)
        .map(|i| message(&event(&format!("e{}", i), &format!("user-{}", i % 7))))
        .collect();
    broker.write_messages(messages).await.unwrap();

    assert_eq!(pool.drain(Duration::from_secs(10)).await.unwrap(), 0);
    assert_eq!(group.lag().unwrap(), 0);
    assert_eq!(metrics.counter_value("consumer.events.received"), 2000);

    assert_eq!(pool.stop().await.unwrap(), 3);
    let committed: usize = log.lock().iter().map(|(_, ids)| ids.len()).sum();
    assert_eq!(committed, 2000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_gives_up_at_deadline() {
    let broker = InMemoryBroker::new(1, Duration::from_secs(1));
    let group = Arc::new(broker.consumer_group("g"));
    let (pool, _) = worker_pool(
        StalledWriter,
        group.clone(),
        consumer_config(1, Duration::from_millis(100)),
    );
    pool.start(1).unwrap();

    // The worker blocks on its first commit, leaving the rest unread.
    let messages = (0..5).map(|i| message(&event(&format!("e{}", i), "u"))).collect();
    broker.write_messages(messages).await.unwrap();

    let started = std::time::Instant::now();
    let unfetched = pool.drain(Duration::from_millis(200)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(unfetched, 4);
}

#[tokio::test]
async fn test_commit_failure_redirects_whole_batch_to_retry() {
    let metrics = MetricsRegistry::new();
    let key = failed_events_key(Utc::now());

    let mut writer = MockWriter::new();
    writer
        .expect_commit()
        .times(2)
        .returning(|_| Err(StoreError::store("Constraint Error: CHECK constraint failed")));

    let mut cache = MockCache::new();
    let rpush_key = key.clone();
    cache
        .expect_rpush()
        .withf(move |k: &str, values: &Vec<String>| {
            k == rpush_key
                && values.len() == 5
                && values.iter().all(|v| Event::from_json(v.as_bytes()).is_ok())
        })
        .times(2)
        .returning(|_, values| Ok(values.len()));
    // Refreshed to the full retention on every append.
    let expire_key = key.clone();
    cache
        .expect_expire()
        .withf(move |k: &str, ttl: &Duration| k == expire_key && *ttl == Duration::from_secs(86_400))
        .times(2)
        .returning(|_, _| Ok(true));
    // No aggregates for a batch that was not written.
    cache.expect_hincr_by().never();
    cache.expect_pfadd().never();

    let processor = batch_processor(writer, Arc::new(cache), &consumer_config(100, Duration::from_millis(100)), &metrics);
    assert_eq!(processor.process(batch(5)).await, FlushOutcome::Retried(5));
    assert_eq!(processor.process(batch(5)).await, FlushOutcome::Retried(5));

    assert_eq!(metrics.counter_value("consumer.errors.insert"), 2);
    assert_eq!(metrics.counter_value("retry.events.stored"), 10);
    assert_eq!(metrics.counter_value("consumer.events.processed"), 0);
}

#[tokio::test]
async fn test_retry_sink_failure_is_terminal() {
    let metrics = MetricsRegistry::new();
    let mut writer = MockWriter::new();
    writer.expect_commit().returning(|_| Err(StoreError::store("down")));
    let mut cache = MockCache::new();
    cache
        .expect_rpush()
        .returning(|_, _| Err(StoreError::cache("connection refused")));
    cache.expect_expire().never();

    let processor = batch_processor(writer, Arc::new(cache), &consumer_config(100, Duration::from_millis(100)), &metrics);
    assert_eq!(processor.process(batch(3)).await, FlushOutcome::Retried(3));
    assert_eq!(metrics.counter_value("retry.errors"), 1);
    assert_eq!(metrics.counter_value("retry.events.stored"), 0);
}

#[tokio::test]
async fn test_successful_commit_updates_aggregates_only() {
    let metrics = MetricsRegistry::new();
    let mut writer = MockWriter::new();
    writer.expect_commit().times(1).returning(|_| Ok(()));

    let mut cache = MockCache::new();
    cache.expect_rpush().never();
    cache
        .expect_hincr_by()
        .withf(|_: &str, field: &str, delta: &i64| field == "page_view" && *delta == 4)
        .times(1)
        .returning(|_, _, delta| Ok(delta));
    cache
        .expect_pfadd()
        .withf(|key: &str, members: &[String]| key.starts_with("users:daily:") && members.len() == 1)
        .times(1)
        .returning(|_, _| Ok(true));
    cache.expect_expire().times(2).returning(|_, _| Ok(true));

    let processor = batch_processor(writer, Arc::new(cache), &consumer_config(100, Duration::from_millis(100)), &metrics);
    assert_eq!(processor.process(batch(4)).await, FlushOutcome::Committed(4));
    assert_eq!(metrics.counter_value("consumer.events.processed"), 4);
    assert_eq!(metrics.snapshot().histograms["consumer.batch.processing_time"].0, 1);
}

#[tokio::test]
async fn test_aggregate_errors_are_swallowed() {
    let metrics = MetricsRegistry::new();
    let mut writer = MockWriter::new();
    writer.expect_commit().returning(|_| Ok(()));

    let mut cache = MockCache::new();
    cache
        .expect_hincr_by()
        .returning(|_, _, _| Err(StoreError::cache("timeout")));
    cache.expect_pfadd().times(1).returning(|_, _| Ok(true));
    cache.expect_expire().times(1).returning(|_, _| Ok(true));

    let processor = batch_processor(writer, Arc::new(cache), &consumer_config(100, Duration::from_millis(100)), &metrics);
    assert_eq!(processor.process(batch(2)).await, FlushOutcome::Committed(2));
    assert_eq!(metrics.counter_value("realtime.errors"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_commit_deadline_expiry_is_a_failure() {
    let metrics = MetricsRegistry::new();
    let cache = Arc::new(MemoryCacheStore::default());
    let processor = batch_processor(StalledWriter, cache, &consumer_config(100, Duration::from_millis(100)), &metrics);

    let start = Instant::now();
    assert_eq!(processor.process(batch(3)).await, FlushOutcome::Retried(3));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));

    let today = Utc::now().date_naive();
    assert_eq!(processor.retry_sink().pending(today).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_reprocess_replays_retry_list() {
    let metrics = MetricsRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let sizes = Arc::new(Mutex::new(Vec::new()));

    let mut writer = MockWriter::new();
    let (calls_in, sizes_in) = (calls.clone(), sizes.clone());
    writer.expect_commit().returning(move |batch| {
        sizes_in.lock().push(batch.len());
        if calls_in.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(StoreError::store("transient"))
        } else {
            Ok(())
        }
    });

    let cache = Arc::new(MemoryCacheStore::default());
    let processor = batch_processor(writer, cache, &consumer_config(2, Duration::from_millis(100)), &metrics);

    assert_eq!(processor.process(batch(5)).await, FlushOutcome::Retried(5));
    let today = Utc::now().date_naive();
    let report = processor.reprocess(today).await.unwrap();

    assert_eq!(report.drained, 5);
    assert_eq!(report.committed, 5);
    assert_eq!(report.retried, 0);
    assert_eq!(*sizes.lock(), vec![5, 2, 2, 1]);
    assert!(processor.retry_sink().pending(today).await.unwrap().is_empty());

    let empty_day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    assert_eq!(processor.reprocess(empty_day).await.unwrap().drained, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_end_to_end() {
    let mut settings = Settings::default();
    settings.consumer.workers = 2;
    settings.consumer.flush_interval_ms = 20;
    settings.store.pool_size = 2;
    let pipeline = Pipeline::build(settings).await.unwrap();
    pipeline.start().unwrap();

    let at = |hour, minute| Some(Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap());
    let inbound = vec![
        NewEvent {
            user_id: "alice".to_string(),
            event_type: Some(EventType::PageView),
            timestamp: at(10, 5),
            ..Default::default()
        },
        NewEvent {
            user_id: "bob".to_string(),
            event_type: Some(EventType::PageView),
            timestamp: at(10, 50),
            ..Default::default()
        },
        NewEvent {
            user_id: "alice".to_string(),
            event_type: Some(EventType::Purchase),
            timestamp: at(11, 2),
            ..Default::default()
        },
    ];
    let published = pipeline.service.process_events(inbound).await.unwrap();
    assert_eq!(published.len(), 3);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while pipeline.metrics.counter_value("consumer.events.received") < 3 {
        assert!(std::time::Instant::now() < deadline, "events never arrived");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pipeline.shutdown().await.unwrap(), 2);

    assert_eq!(pipeline.store.count_events().await.unwrap(), 3);
    let alice = pipeline.store.events_for_user("alice").await.unwrap();
    assert_eq!(alice.len(), 2);
    assert_eq!(alice[0].id, published[0].id);

    let realtime = pipeline.processor.realtime();
    let ten = realtime.hourly_counts(at(10, 0).unwrap()).await.unwrap();
    assert_eq!(ten.get(&EventType::PageView), Some(&2));
    let eleven = realtime.hourly_counts(at(11, 0).unwrap()).await.unwrap();
    assert_eq!(eleven.get(&EventType::Purchase), Some(&1));
    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    assert_eq!(realtime.unique_users(day).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_stores_every_published_event() {
    let mut settings = Settings::default();
    settings.store.pool_size = 2;
    let pipeline = Pipeline::build(settings).await.unwrap();
    pipeline.start().unwrap();

    let inbound = (0..5000)
        .map(|i| NewEvent {
            user_id: format!("user-{}", i % 50),
            event_type: Some(EventType::ALL[i % EventType::ALL.len()]),
            ..Default::default()
        })
        .collect();
    let published = pipeline.service.process_events(inbound).await.unwrap();
    assert_eq!(published.len(), 5000);

    // No waiting for the workers: shutdown itself must not lose anything.
    assert_eq!(pipeline.shutdown().await.unwrap(), 5);
    assert_eq!(pipeline.store.count_events().await.unwrap(), 5000);
    assert_eq!(pipeline.metrics.counter_value("consumer.events.processed"), 5000);
    assert_eq!(pipeline.metrics.counter_value("events.received"), 5000);
}

#[tokio::test]
async fn test_pipeline_rejects_unreachable_cache_url() {
    let mut settings = Settings::default();
    settings.cache.url = Some("not-a-redis-url".to_string());
    assert!(matches!(
        Pipeline::build(settings).await,
        Err(PipelineError::Store(StoreError::Cache(_)))
    ));
}

/// A batch parked by one process is drained by a later one through a fresh
/// connection. Runs against `EVENTSTREAM_TEST_REDIS_URL`; skipped when unset.
#[tokio::test]
async fn test_retry_list_survives_into_a_new_process() {
    let Ok(url) = std::env::var("EVENTSTREAM_TEST_REDIS_URL") else {
        return;
    };
    let today = Utc::now().date_naive();
    let config = consumer_config(100, Duration::from_millis(100));

    {
        let cache = Arc::new(RedisCacheStore::connect(&url).await.unwrap());
        cache.take_list(&failed_events_key(Utc::now())).await.unwrap();

        let mut writer = MockWriter::new();
        writer
            .expect_commit()
            .returning(|_| Err(StoreError::store("database is locked")));
        let processor = batch_processor(writer, cache, &config, &MetricsRegistry::new());
        assert_eq!(processor.process(batch(5)).await, FlushOutcome::Retried(5));
    }

    let cache = Arc::new(RedisCacheStore::connect(&url).await.unwrap());
    let log = CommitLog::default();
    let processor = batch_processor(recording_writer(log.clone()), cache, &config, &MetricsRegistry::new());
    let report = processor.reprocess(today).await.unwrap();

    assert_eq!(report.drained, 5);
    assert_eq!(report.committed, 5);
    assert_eq!(log.lock()[0].1, vec!["e0", "e1", "e2", "e3", "e4"]);
}
