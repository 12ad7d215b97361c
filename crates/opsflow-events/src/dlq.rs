//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use tracing::warn;

use crate::envelope::{DLQEnvelope, EventEnvelope, HandlerError};
use crate::metrics::EventMetrics;
use crate::producer::EventProducer;
use crate::topics::Topic;
use crate::Result;

/// `event_type` of carrier envelopes on the dead-letter topic.
pub const DLQ_EVENT_TYPE: &str = "dlq.failed";
/// `source` of carrier envelopes on the dead-letter topic.
pub const DLQ_SOURCE: &str = "dead_letter_queue";

/// Moves events that keep failing onto the dead-letter topic.
#[derive(Debug)]
pub struct DeadLetterQueue {
    producer: EventProducer,
    max_retries: u32,
    metrics: Option<EventMetrics>,
}

impl DeadLetterQueue {
    /// Dead-letter queue publishing through `producer`.
    pub fn new(producer: EventProducer, max_retries: u32) -> Self {
        Self {
            producer,
            max_retries,
            metrics: None,
        }
    }

    /// Attach metric handles.
    pub fn with_metrics(mut self, metrics: EventMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Failed deliveries tolerated before an event is dead-lettered.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether an event already redelivered `retry_count` times deserves another delivery.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Publish a dead-letter record for `event` and return it.
    pub async fn send_to_dlq(
        &self,
        event: &EventEnvelope,
        error: &HandlerError,
        source_topic: &str,
        retry_count: u32,
    ) -> Result<DLQEnvelope> {
        let record = DLQEnvelope::new(
            event.clone(),
            error,
            source_topic,
            retry_count,
            self.max_retries,
        );
        let mut carrier = EventEnvelope::new(DLQ_EVENT_TYPE, DLQ_SOURCE, record.to_payload()?);
        if let Some(correlation_id) = event.correlation_id() {
            carrier = carrier.with_correlation_id(correlation_id);
        }
        self.producer.publish(Topic::DeadLetter, &carrier).await?;

        warn!(
            event = "event_dead_lettered",
            event_id = %event.event_id(),
            event_type = event.event_type(),
            dlq_id = %record.dlq_id,
            source_topic,
            retry_count,
            error_type = %error.kind,
            error = %error.message,
            "event moved to dead-letter queue"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_dead_lettered(source_topic);
        }
        Ok(record)
    }
}
