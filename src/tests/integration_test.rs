use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    Broker, GroupSession, InMemoryBroker, Partitioner, ProduceRecord, RecordMetadata, RequiredAcks,
};
use crate::config::Settings;
use crate::persistence::Store;
use crate::pipeline::{Message, Pipeline};
use crate::utils::error::{BrokerError, PipelineError};

const WAIT: Duration = Duration::from_secs(5);
const GROUP: &str = "link-updates";

struct Harness {
    _dir: TempDir,
    settings: Settings,
    store: Store,
    broker: InMemoryBroker,
    pipeline: Pipeline,
}

async fn start() -> Harness {
    let broker = InMemoryBroker::default();
    start_with(Arc::new(broker.clone()), broker, |_| {}).await
}

/// Start a pipeline on `broker`; `inner` is the in-memory broker behind it,
/// kept for inspection.
async fn start_with(broker: Arc<dyn Broker>, inner: InMemoryBroker, configure: impl FnOnce(&mut Settings)) -> Harness {
    let dir = tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.brokers = vec!["in-memory".into()];
    settings.consumer.topics = vec!["t".into()];
    settings.consumer.group_id = GROUP.into();
    settings.producer.retry_backoff_ms = 1;
    settings.retrier.max_retries = 3;
    settings.retrier.check_interval_ms = 20;
    settings.retrier.initial_delay_ms = 10;
    settings.storage.path = dir.path().join("db").to_string_lossy().into_owned();
    configure(&mut settings);
    settings.validate().expect("valid settings");

    let store = Store::open(&settings.storage.path).expect("open store");
    let pipeline = Pipeline::start(&settings, broker, store.clone(), CancellationToken::new())
        .await
        .expect("pipeline start");

    Harness {
        _dir: dir,
        settings,
        store,
        broker: inner,
        pipeline,
    }
}

/// Delegates to an [`InMemoryBroker`] but fails the next `failures` joins.
struct FlakyJoins {
    inner: InMemoryBroker,
    failures: AtomicUsize,
}

#[async_trait]
impl Broker for FlakyJoins {
    async fn produce(
        &self,
        record: ProduceRecord,
        partitioner: Partitioner,
        acks: RequiredAcks,
    ) -> Result<RecordMetadata, BrokerError> {
        self.inner.produce(record, partitioner, acks).await
    }

    async fn join(&self, group: &str, member_id: &str, topics: &[String]) -> Result<GroupSession, BrokerError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Unavailable("coordinator moving".into()));
        }
        self.inner.join(group, member_id, topics).await
    }

    async fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        self.inner.commit(group, topic, partition, offset).await
    }

    async fn committed(&self, group: &str, topic: &str, partition: i32) -> Result<Option<i64>, BrokerError> {
        self.inner.committed(group, topic, partition).await
    }

    async fn leave(&self, group: &str, member_id: &str) {
        self.inner.leave(group, member_id).await
    }
}

/// Revoke every session of the group by passing another member through it.
async fn rebalance(broker: &InMemoryBroker) {
    let session = broker
        .join(GROUP, "other-member", &["t".to_string()])
        .await
        .expect("second member joins");
    drop(session);
    broker.leave(GROUP, "other-member").await;
}

async fn next_message(messages: &mut mpsc::Receiver<Message>) -> Message {
    tokio::time::timeout(WAIT, messages.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("pipeline closed the output channel")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn stop(harness: Harness) {
    harness.pipeline.handle.shutdown();
    tokio::time::timeout(WAIT, harness.pipeline.handle.wait())
        .await
        .expect("pipeline did not stop")
        .expect("pipeline failed");
}

#[tokio::test]
async fn integration_ack_commits_offset() {
    let mut h = start().await;
    let meta = h.pipeline.publisher.publish("t", "k", "v").await.unwrap();

    let message = next_message(&mut h.pipeline.messages).await;
    assert_eq!(message.redelivery_count(), 0);
    assert_eq!(message.payload(), "v");
    assert_eq!((message.partition(), message.offset()), (meta.partition, meta.offset));
    message.ack().await.unwrap();

    let broker = h.broker.clone();
    eventually("offset commit", || {
        let broker = broker.clone();
        async move { broker.committed(GROUP, "t", meta.partition).await.unwrap() == Some(meta.offset + 1) }
    })
    .await;

    let retries = h.store.retry_table(&h.settings.retrier.table).unwrap();
    let dead_letters = h.store.dead_letter_table(&h.settings.dead_letter.table).unwrap();
    assert!(retries.is_empty());
    assert!(dead_letters.is_empty());

    stop(h).await;
}

#[tokio::test]
async fn integration_nack_until_dead_letter() {
    let mut h = start().await;
    let meta = h.pipeline.publisher.publish("t", "k", "v").await.unwrap();
    let retries = h.store.retry_table(&h.settings.retrier.table).unwrap();
    let dead_letters = h.store.dead_letter_table(&h.settings.dead_letter.table).unwrap();

    for expected in 0..3 {
        let message = next_message(&mut h.pipeline.messages).await;
        assert_eq!(message.redelivery_count(), expected);
        assert_eq!(message.offset(), meta.offset);
        assert_eq!(message.payload(), "v");
        message.nack().await.unwrap();
    }

    eventually("dead letter", || {
        let dead_letters = dead_letters.clone();
        async move { dead_letters.len() == 1 }
    })
    .await;

    let rows = dead_letters.list().unwrap();
    assert_eq!(rows[0].topic, "t");
    assert_eq!(rows[0].partition, meta.partition);
    assert_eq!(rows[0].kafka_offset, meta.offset);
    assert_eq!(rows[0].retry_count, 3);
    assert_eq!(rows[0].value, "v");
    assert!(retries.is_empty());

    // Quarantine is terminal: nothing comes back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.pipeline.messages.try_recv().is_err());
    assert!(retries.is_empty());

    stop(h).await;
}

#[tokio::test]
async fn integration_quarantine_on_first_delivery_commits_offset() {
    let mut h = start().await;
    let meta = h.pipeline.publisher.publish("t", "k", "{not json").await.unwrap();

    let message = next_message(&mut h.pipeline.messages).await;
    assert!(message.bind::<serde_json::Value>().is_err());
    message.quarantine().await.unwrap();

    let broker = h.broker.clone();
    eventually("offset commit", || {
        let broker = broker.clone();
        async move { broker.committed(GROUP, "t", meta.partition).await.unwrap() == Some(meta.offset + 1) }
    })
    .await;

    let dead_letters = h.store.dead_letter_table(&h.settings.dead_letter.table).unwrap();
    let rows = dead_letters.list().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].retry_count, 0);
    assert_eq!(rows[0].value, "{not json");

    stop(h).await;
}

#[tokio::test]
async fn integration_redelivers_uncommitted_records_after_restart() {
    let mut h = start().await;
    h.pipeline.publisher.publish("t", "k", "first").await.unwrap();

    // Delivered but never finished.
    let message = next_message(&mut h.pipeline.messages).await;
    assert_eq!(message.payload(), "first");
    drop(message);

    let broker = h.broker.clone();
    let settings = h.settings.clone();
    let store = h.store.clone();
    let dir = h._dir;
    h.pipeline.handle.shutdown();
    h.pipeline.handle.wait().await.unwrap();

    let mut restarted = Pipeline::start(&settings, Arc::new(broker), store, CancellationToken::new())
        .await
        .unwrap();
    let again = next_message(&mut restarted.messages).await;
    assert_eq!(again.payload(), "first");
    assert_eq!(again.redelivery_count(), 0);
    again.ack().await.unwrap();

    restarted.handle.shutdown();
    restarted.handle.wait().await.unwrap();
    drop(dir);
}

#[tokio::test]
async fn integration_redelivers_claimed_retry_after_restart() {
    let mut h = start().await;
    let retries = h.store.retry_table(&h.settings.retrier.table).unwrap();
    h.pipeline.publisher.publish("t", "k", "v").await.unwrap();
    next_message(&mut h.pipeline.messages).await.nack().await.unwrap();

    // Held by the application when the pipeline stops.
    let held = next_message(&mut h.pipeline.messages).await;
    assert_eq!(held.redelivery_count(), 1);
    assert!(retries.is_empty());
    assert_eq!(retries.claimed_len(), 1);

    let Harness {
        _dir: dir,
        settings,
        store,
        broker,
        pipeline,
    } = h;
    pipeline.handle.shutdown();
    pipeline.handle.wait().await.unwrap();

    assert!(held.nack().await.is_err());
    assert_eq!(retries.claimed_len(), 1);

    let mut restarted = Pipeline::start(&settings, Arc::new(broker), store, CancellationToken::new())
        .await
        .unwrap();
    // The uncommitted original comes back from the broker as well.
    let redelivered = loop {
        let message = next_message(&mut restarted.messages).await;
        assert_eq!(message.payload(), "v");
        if message.redelivery_count() == 1 {
            break message;
        }
        message.ack().await.unwrap();
    };
    redelivered.ack().await.unwrap();
    assert_eq!(retries.claimed_len(), 0);
    assert!(retries.is_empty());

    restarted.handle.shutdown();
    restarted.handle.wait().await.unwrap();
    drop(dir);
}

#[tokio::test]
async fn integration_keeps_delivering_across_rebalance() {
    let mut h = start().await;
    let meta = h.pipeline.publisher.publish("t", "k", "before").await.unwrap();
    next_message(&mut h.pipeline.messages).await.ack().await.unwrap();

    let broker = h.broker.clone();
    eventually("offset commit", || {
        let broker = broker.clone();
        async move { broker.committed(GROUP, "t", meta.partition).await.unwrap() == Some(meta.offset + 1) }
    })
    .await;

    rebalance(&h.broker).await;
    h.pipeline.publisher.publish("t", "k", "after").await.unwrap();

    let message = next_message(&mut h.pipeline.messages).await;
    assert_eq!(message.payload(), "after");
    assert_eq!(message.redelivery_count(), 0);
    message.ack().await.unwrap();
    assert!(h.pipeline.handle.is_running());

    stop(h).await;
}

#[tokio::test]
async fn integration_rejoin_survives_failed_joins() {
    let inner = InMemoryBroker::default();
    let flaky = Arc::new(FlakyJoins {
        inner: inner.clone(),
        failures: AtomicUsize::new(0),
    });
    let mut h = start_with(flaky.clone(), inner, |settings| {
        settings.consumer.reconnect_backoff_ms = 10;
        settings.consumer.return_errors = true;
    })
    .await;

    flaky.failures.store(2, Ordering::SeqCst);
    rebalance(&h.broker).await;
    h.pipeline.publisher.publish("t", "k", "v").await.unwrap();

    let message = next_message(&mut h.pipeline.messages).await;
    assert_eq!(message.payload(), "v");
    message.ack().await.unwrap();
    assert_eq!(flaky.failures.load(Ordering::SeqCst), 0);
    assert!(h.pipeline.handle.is_running());

    stop(h).await;
}

#[tokio::test]
async fn integration_publish_fails_fast_when_breaker_is_open() {
    let h = start().await;
    h.broker.set_available(false);

    let mut failures = 0;
    let err = loop {
        let err = h.pipeline.publisher.publish("t", "k", "v").await.unwrap_err();
        if err.is_unavailable() && !matches!(err, PipelineError::Broker(_)) {
            break err;
        }
        failures += 1;
        assert!(failures <= 5, "breaker never opened");
    };
    assert!(matches!(err, PipelineError::CircuitOpen));

    h.broker.set_available(true);
    stop(h).await;
}
