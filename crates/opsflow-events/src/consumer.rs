//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
//! Group consumer with per-event failure counting.
//!
//! A handler failure bumps the counter for that `event_id`. With a dead-letter
//! queue allowing `max_retries` redeliveries, failure number `max_retries + 1`
//! dead-letters the event and forgets it; until then the consumer relies on the
//! event being delivered again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Record, SharedBroker};
use crate::dlq::DeadLetterQueue;
use crate::envelope::{EventEnvelope, HandlerError};
use crate::metrics::EventMetrics;
use crate::topics::{decode, Topic};
use crate::Result;

const DEFAULT_MAX_POLL_RECORDS: usize = 100;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Tally of a single poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeReport {
    /// Records returned by the broker.
    pub fetched: usize,
    /// Envelopes the handler accepted.
    pub succeeded: usize,
    /// Envelopes the handler rejected.
    pub failed: usize,
    /// Envelopes moved to the dead-letter topic.
    pub dead_lettered: usize,
    /// Records that could not be decoded.
    pub skipped: usize,
}

/// Consumer of application topics for one consumer group.
#[derive(Debug)]
pub struct EventConsumer {
    broker: SharedBroker,
    topics: Vec<String>,
    group_id: String,
    max_poll_records: usize,
    poll_interval: Duration,
    dlq: Option<Arc<DeadLetterQueue>>,
    metrics: Option<EventMetrics>,
    retry_counts: HashMap<Uuid, u32>,
}

impl EventConsumer {
    /// Consumer for `topics` in `group_id`, without a dead-letter queue.
    pub fn new(broker: SharedBroker, topics: &[Topic], group_id: impl Into<String>) -> Self {
        Self {
            broker,
            topics: topics.iter().map(|topic| topic.as_str().to_owned()).collect(),
            group_id: group_id.into(),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            dlq: None,
            metrics: None,
            retry_counts: HashMap::new(),
        }
    }

    /// Upper bound on records per poll.
    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records.max(1);
        self
    }

    /// Idle delay used by [`EventConsumer::run`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Dead-letter events whose failure budget is spent.
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Attach metric handles.
    pub fn with_metrics(mut self, metrics: EventMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscribed topic names.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Consumer group.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Failures recorded so far for `event_id`.
    pub fn retry_count(&self, event_id: Uuid) -> Option<u32> {
        self.retry_counts.get(&event_id).copied()
    }

    /// Number of events with an outstanding failure count.
    pub fn pending_retries(&self) -> usize {
        self.retry_counts.len()
    }

    /// Poll once and hand every decodable envelope to `handler`.
    pub async fn consume<H, Fut>(&mut self, mut handler: H) -> Result<ConsumeReport>
    where
        H: FnMut(EventEnvelope) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        let records = self.poll().await?;
        let mut report = ConsumeReport {
            fetched: records.len(),
            ..ConsumeReport::default()
        };
        for record in records {
            let Some(envelope) = self.decode_record(&record) else {
                report.skipped += 1;
                continue;
            };
            match handler(envelope.clone()).await {
                Ok(()) => {
                    self.retry_counts.remove(&envelope.event_id());
                    report.succeeded += 1;
                    self.count(&record.topic, "success");
                }
                Err(err) => {
                    report.failed += 1;
                    self.count(&record.topic, "failure");
                    if self.handle_failure(&record.topic, &envelope, &err).await {
                        report.dead_lettered += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Poll once and hand the whole decoded batch to `handler`.
    ///
    /// A failed batch is dead-lettered event by event with a retry count of 1,
    /// since no per-event history applies to batch failures.
    pub async fn consume_batch<H, Fut>(&mut self, handler: H) -> Result<ConsumeReport>
    where
        H: FnOnce(Vec<EventEnvelope>) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        let records = self.poll().await?;
        let mut report = ConsumeReport {
            fetched: records.len(),
            ..ConsumeReport::default()
        };
        let mut batch = Vec::with_capacity(records.len());
        for record in &records {
            match self.decode_record(record) {
                Some(envelope) => batch.push((record.topic.clone(), envelope)),
                None => report.skipped += 1,
            }
        }
        if batch.is_empty() {
            return Ok(report);
        }

        let envelopes = batch.iter().map(|(_, envelope)| envelope.clone()).collect();
        match handler(envelopes).await {
            Ok(()) => {
                for (topic, envelope) in &batch {
                    self.retry_counts.remove(&envelope.event_id());
                    self.count(topic, "success");
                }
                report.succeeded = batch.len();
            }
            Err(err) => {
                report.failed = batch.len();
                let Some(dlq) = self.dlq.clone() else {
                    error!(
                        group = %self.group_id,
                        batch_size = batch.len(),
                        error = %err,
                        "batch handler failed; no dead-letter queue configured"
                    );
                    for (topic, _) in &batch {
                        self.count(topic, "failure");
                    }
                    return Ok(report);
                };
                for (topic, envelope) in &batch {
                    self.count(topic, "failure");
                    match dlq.send_to_dlq(envelope, &err, topic, 1).await {
                        Ok(_) => {
                            self.retry_counts.remove(&envelope.event_id());
                            report.dead_lettered += 1;
                        }
                        Err(send_err) => error!(
                            event_id = %envelope.event_id(),
                            error = %send_err,
                            "failed to dead-letter batch member"
                        ),
                    }
                }
            }
        }
        Ok(report)
    }

    /// Consume until `shutdown` resolves, sleeping for the poll interval when idle.
    ///
    /// Shutdown is observed between polls and while idle, never in the middle of a
    /// poll, so every fetched record reaches the handler. Broker errors are logged and
    /// retried; a bad message never stops the loop.
    pub async fn run<H, Fut, S>(&mut self, mut handler: H, shutdown: S)
    where
        H: FnMut(EventEnvelope) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(group = %self.group_id, topics = ?self.topics, "event consumer started");
        loop {
            if shutdown.as_mut().now_or_never().is_some() {
                break;
            }
            let idle = match self.consume(&mut handler).await {
                Ok(report) => report.fetched == 0,
                Err(err) => {
                    error!(group = %self.group_id, error = %err, "poll failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!(
            group = %self.group_id,
            pending_retries = self.retry_counts.len(),
            "event consumer stopped"
        );
    }

    async fn poll(&self) -> Result<Vec<Record>> {
        let records = self
            .broker
            .fetch(&self.topics, &self.group_id, self.max_poll_records)
            .await?;
        if !records.is_empty() {
            debug!(group = %self.group_id, records = records.len(), "polled records");
        }
        Ok(records)
    }

    fn decode_record(&self, record: &Record) -> Option<EventEnvelope> {
        match decode(&record.value) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "skipping undecodable record"
                );
                self.count(&record.topic, "skipped");
                None
            }
        }
    }

    /// Returns whether the event was dead-lettered.
    async fn handle_failure(
        &mut self,
        topic: &str,
        envelope: &EventEnvelope,
        err: &HandlerError,
    ) -> bool {
        let event_id = envelope.event_id();
        let retry_count = {
            let count = self.retry_counts.entry(event_id).or_insert(0);
            *count += 1;
            *count
        };

        // The first failure is the original delivery; every later one used a retry.
        let retries_used = retry_count - 1;
        let dlq = match &self.dlq {
            Some(dlq) if !dlq.should_retry(retries_used) => dlq.clone(),
            _ => {
                warn!(
                    topic,
                    %event_id,
                    event_type = envelope.event_type(),
                    retry_count,
                    error = %err,
                    "event handling failed; awaiting redelivery"
                );
                return false;
            }
        };

        match dlq.send_to_dlq(envelope, err, topic, retry_count).await {
            Ok(_) => {
                self.retry_counts.remove(&event_id);
                true
            }
            Err(send_err) => {
                error!(
                    topic,
                    %event_id,
                    retry_count,
                    error = %send_err,
                    "failed to dead-letter event; keeping retry count"
                );
                false
            }
        }
    }

    fn count(&self, topic: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_consumed(topic, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use crate::producer::EventProducer;
    use bytes::Bytes;
    use serde_json::Map;

    fn setup() -> (InMemoryBroker, EventProducer, EventConsumer) {
        let broker = InMemoryBroker::new(1);
        let shared: SharedBroker = Arc::new(broker.clone());
        let producer = EventProducer::new(shared.clone());
        let consumer = EventConsumer::new(shared, &[Topic::TrackerEvents], "test-group");
        (broker, producer, consumer)
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped() {
        let (broker, producer, mut consumer) = setup();
        broker
            .send(Topic::TrackerEvents.as_str(), None, Bytes::from_static(b"garbage"))
            .await
            .expect("send");
        let event = EventEnvelope::new("task.created", "tracker", Map::new());
        producer.publish(Topic::TrackerEvents, &event).await.expect("publish");

        let report = consumer.consume(|_| async { Ok(()) }).await.expect("consume");
        assert_eq!(report.fetched, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn success_clears_failure_count() {
        let (_broker, producer, mut consumer) = setup();
        let event = EventEnvelope::new("task.updated", "tracker", Map::new());

        producer.publish(Topic::TrackerEvents, &event).await.expect("publish");
        consumer
            .consume(|_| async { Err(HandlerError::new("TimeoutError", "slow")) })
            .await
            .expect("consume");
        assert_eq!(consumer.retry_count(event.event_id()), Some(1));

        producer.publish(Topic::TrackerEvents, &event).await.expect("publish");
        consumer.consume(|_| async { Ok(()) }).await.expect("consume");
        assert_eq!(consumer.retry_count(event.event_id()), None);
        assert_eq!(consumer.pending_retries(), 0);
    }

    #[tokio::test]
    async fn without_dlq_counts_keep_growing() {
        let (_broker, producer, mut consumer) = setup();
        let event = EventEnvelope::new("task.updated", "tracker", Map::new());
        for _ in 0..5 {
            producer.publish(Topic::TrackerEvents, &event).await.expect("publish");
        }
        let report = consumer
            .consume(|_| async { Err(HandlerError::new("TimeoutError", "slow")) })
            .await
            .expect("consume");
        assert_eq!(report.failed, 5);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(consumer.retry_count(event.event_id()), Some(5));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_broker, producer, consumer) = setup();
        let mut consumer = consumer.with_poll_interval(Duration::from_millis(5));
        let event = EventEnvelope::new("task.closed", "tracker", Map::new());
        producer.publish(Topic::TrackerEvents, &event).await.expect("publish");

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let shutdown = async move {
            let _ = rx.await;
        };
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(());
        });
        consumer
            .run(
                |envelope| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().push(envelope.event_id());
                        Ok(())
                    }
                },
                shutdown,
            )
            .await;
        stopper.await.expect("stopper task");
        assert_eq!(seen.lock().as_slice(), &[event.event_id()]);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_polled_batch() {
        let (_broker, producer, consumer) = setup();
        let mut consumer = consumer.with_poll_interval(Duration::from_millis(5));
        let events: Vec<_> = (0..3)
            .map(|n| EventEnvelope::new(format!("task.step{n}"), "tracker", Map::new()))
            .collect();
        for event in &events {
            producer.publish(Topic::TrackerEvents, event).await.expect("publish");
        }

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let shutdown = tokio::time::sleep(Duration::from_millis(60));
        consumer
            .run(
                |envelope| {
                    let sink = sink.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        sink.lock().push(envelope.event_id());
                        Ok(())
                    }
                },
                shutdown,
            )
            .await;

        let expected: Vec<_> = events.iter().map(EventEnvelope::event_id).collect();
        assert_eq!(seen.lock().as_slice(), expected.as_slice());
        let report = consumer.consume(|_| async { Ok(()) }).await.expect("consume");
        assert_eq!(report.fetched, 0);
    }
}
