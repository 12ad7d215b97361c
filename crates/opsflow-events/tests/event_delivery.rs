//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use opsflow_common::config::EventBusSettings;
use opsflow_events::{
    Broker, DLQConsumer, DLQEnvelope, EventBus, EventEnvelope, EventError, EventMetrics,
    EventProducer, HandlerError, InMemoryBroker, Record, RecordMeta, SharedBroker, Topic,
};
use opsflow_metrics::{counter_value, new_registry};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
#[error("handler exploded")]
struct RuntimeError;

fn bus_with(broker: &InMemoryBroker, max_retries: u32) -> EventBus {
    let settings = EventBusSettings {
        max_retries,
        topics: vec![Topic::TrackerEvents.as_str().to_owned()],
        ..EventBusSettings::default()
    };
    EventBus::new(Arc::new(broker.clone()), settings).expect("bus")
}

fn task_event() -> EventEnvelope {
    EventEnvelope::from_value("task.created", "tracker", json!({ "task_id": "T-42" }))
        .expect("object payload")
        .with_correlation_id("corr-42")
}

fn dead_letters(broker: &InMemoryBroker) -> Vec<DLQEnvelope> {
    broker
        .snapshot(Topic::DeadLetter.as_str())
        .iter()
        .map(|record| {
            let carrier = opsflow_events::decode(&record.value).expect("carrier");
            DLQEnvelope::from_payload(carrier.payload()).expect("dead-letter record")
        })
        .collect()
}

async fn deliver_failing(bus: &mut EventBus, event: &EventEnvelope) {
    bus.publish(Topic::TrackerEvents, event).await.expect("publish");
    bus.consumer_mut()
        .consume(|_| async { Err(HandlerError::from(RuntimeError)) })
        .await
        .expect("consume");
}

#[tokio::test]
async fn three_failed_deliveries_dead_letter_once() {
    let broker = InMemoryBroker::new(3);
    let mut bus = bus_with(&broker, 2);
    let event = task_event();

    for expected in 1..=2 {
        deliver_failing(&mut bus, &event).await;
        assert_eq!(bus.consumer().retry_count(event.event_id()), Some(expected));
        assert!(dead_letters(&broker).is_empty());
    }
    deliver_failing(&mut bus, &event).await;

    let entries = dead_letters(&broker);
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.max_retries, 2);
    assert_eq!(entry.error_type, "RuntimeError");
    assert_eq!(entry.error_message, "handler exploded");
    assert_eq!(entry.source_topic, "opsflow.tracker.events");
    assert_eq!(entry.original_event, event);
    assert_eq!(entry.original_event.payload(), event.payload());
    assert_eq!(bus.consumer().retry_count(event.event_id()), None);

    // A further failure starts a fresh count instead of dead-lettering again.
    deliver_failing(&mut bus, &event).await;
    assert_eq!(dead_letters(&broker).len(), 1);
    assert_eq!(bus.consumer().retry_count(event.event_id()), Some(1));
}

#[tokio::test]
async fn recovery_before_budget_never_dead_letters() {
    for retries in 1..=4u32 {
        let broker = InMemoryBroker::new(1);
        let mut bus = bus_with(&broker, retries);
        let event = task_event();
        for _ in 0..retries {
            deliver_failing(&mut bus, &event).await;
        }
        bus.publish(Topic::TrackerEvents, &event).await.expect("publish");
        let report = bus
            .consumer_mut()
            .consume(|_| async { Ok(()) })
            .await
            .expect("consume");
        assert_eq!(report.succeeded, 1);
        assert!(dead_letters(&broker).is_empty());
        assert_eq!(bus.consumer().pending_retries(), 0);
    }
}

#[tokio::test]
async fn failed_batch_dead_letters_every_member_once() {
    let broker = InMemoryBroker::new(1);
    let mut bus = bus_with(&broker, 3);
    let events: Vec<_> = (0..3).map(|_| task_event()).collect();
    for event in &events {
        bus.publish(Topic::TrackerEvents, event).await.expect("publish");
    }
    let report = bus
        .consumer_mut()
        .consume_batch(|batch| async move {
            assert_eq!(batch.len(), 3);
            Err(HandlerError::new("BatchError", "bulk insert failed"))
        })
        .await
        .expect("consume batch");
    assert_eq!(report.dead_lettered, 3);
    let entries = dead_letters(&broker);
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|entry| entry.retry_count == 1));
    assert!(entries.iter().all(|entry| entry.error_type == "BatchError"));
}

#[tokio::test]
async fn failed_batch_without_dlq_is_logged_and_consumption_continues() {
    let broker = InMemoryBroker::new(1);
    let settings = EventBusSettings {
        enable_dlq: false,
        topics: vec![Topic::TrackerEvents.as_str().to_owned()],
        ..EventBusSettings::default()
    };
    let mut bus = EventBus::new(Arc::new(broker.clone()), settings).expect("bus");
    for _ in 0..2 {
        bus.publish(Topic::TrackerEvents, &task_event()).await.expect("publish");
    }

    let report = bus
        .consumer_mut()
        .consume_batch(|_| async { Err(HandlerError::new("BatchError", "bulk insert failed")) })
        .await
        .expect("consume batch");
    assert_eq!(report.failed, 2);
    assert_eq!(report.dead_lettered, 0);
    assert!(broker.snapshot(Topic::DeadLetter.as_str()).is_empty());

    let fresh = task_event();
    bus.publish(Topic::TrackerEvents, &fresh).await.expect("publish");
    let expected = fresh.event_id();
    let report = bus
        .consumer_mut()
        .consume_batch(|batch| async move {
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].event_id(), expected);
            Ok(())
        })
        .await
        .expect("consume batch");
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
}

/// Broker whose sends to one topic fail on selected attempts.
#[derive(Debug)]
struct FlakyBroker {
    inner: InMemoryBroker,
    topic: &'static str,
    sends: AtomicUsize,
    fail_on: Vec<usize>,
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: Bytes,
    ) -> opsflow_events::Result<RecordMeta> {
        if topic == self.topic {
            let attempt = self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&attempt) {
                return Err(EventError::Broker("leader not available".into()));
            }
        }
        self.inner.send(topic, key, value).await
    }

    async fn fetch(
        &self,
        topics: &[String],
        group: &str,
        max_records: usize,
    ) -> opsflow_events::Result<Vec<Record>> {
        self.inner.fetch(topics, group, max_records).await
    }

    async fn records(&self, topic: &str) -> opsflow_events::Result<Vec<Record>> {
        self.inner.records(topic).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn filtered_replay_counts_only_successful_publishes() {
    let inner = InMemoryBroker::new(1);
    let flaky: SharedBroker = Arc::new(FlakyBroker {
        inner: inner.clone(),
        topic: "opsflow.agent.events",
        sends: AtomicUsize::new(0),
        fail_on: vec![1],
    });
    let bus = EventBus::new(flaky.clone(), EventBusSettings::default()).expect("bus");
    let dlq = bus.dlq().expect("dlq enabled");

    let timeout = HandlerError::new("TimeoutError", "agent registry timed out");
    for n in 0..4 {
        let event = EventEnvelope::from_value("agent.heartbeat", "agents", json!({ "n": n }))
            .expect("object payload");
        dlq.send_to_dlq(&event, &timeout, Topic::AgentEvents.as_str(), 3)
            .await
            .expect("dead-letter");
    }
    let other = EventEnvelope::from_value("task.created", "tracker", json!({}))
        .expect("object payload");
    let invalid = HandlerError::new("ValidationError", "bad");
    dlq.send_to_dlq(&other, &invalid, Topic::TrackerEvents.as_str(), 3)
        .await
        .expect("dead-letter");

    let producer = EventProducer::new(flaky.clone());
    let mut consumer: DLQConsumer = bus.dlq_consumer();
    consumer.start();
    let only_timeouts: &(dyn Fn(&DLQEnvelope) -> bool + Send + Sync) =
        &|entry: &DLQEnvelope| entry.error_type == "TimeoutError";
    let replayed = consumer
        .replay(&producer, Some(only_timeouts))
        .await
        .expect("replay");

    assert_eq!(replayed, 3);
    assert_eq!(inner.snapshot(Topic::AgentEvents.as_str()).len(), 3);
    assert!(inner.snapshot(Topic::TrackerEvents.as_str()).is_empty());
    assert_eq!(consumer.replay(&producer, None).await.expect("replay again"), 0);
}

#[tokio::test]
async fn metrics_follow_the_event_lifecycle() {
    let registry = new_registry();
    let metrics = EventMetrics::new(registry.clone()).expect("metrics");
    let broker = InMemoryBroker::new(1);
    let mut bus = bus_with(&broker, 1).with_metrics(metrics);
    let event = task_event();

    deliver_failing(&mut bus, &event).await;
    deliver_failing(&mut bus, &event).await;
    let mut dlq_consumer = bus.dlq_consumer();
    dlq_consumer.start();
    assert_eq!(dlq_consumer.replay(bus.producer(), None).await.expect("replay"), 1);

    let tracker = Topic::TrackerEvents.as_str();
    assert_eq!(
        counter_value(&registry, "opsflow_events_published_total", &[("topic", tracker)]),
        Some(3.0)
    );
    assert_eq!(
        counter_value(
            &registry,
            "opsflow_events_consumed_total",
            &[("topic", tracker), ("outcome", "failure")],
        ),
        Some(2.0)
    );
    assert_eq!(
        counter_value(
            &registry,
            "opsflow_events_dead_lettered_total",
            &[("source_topic", tracker)],
        ),
        Some(1.0)
    );
    assert_eq!(
        counter_value(&registry, "opsflow_events_replayed_total", &[("topic", tracker)]),
        Some(1.0)
    );
}
