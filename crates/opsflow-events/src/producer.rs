//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use tracing::debug;

use crate::broker::{RecordMeta, SharedBroker};
use crate::envelope::EventEnvelope;
use crate::metrics::EventMetrics;
use crate::topics::{encode, Topic};
use crate::Result;

/// Publishes envelopes to topics. Does not retry on its own.
#[derive(Debug, Clone)]
pub struct EventProducer {
    broker: SharedBroker,
    metrics: Option<EventMetrics>,
}

impl EventProducer {
    /// Producer writing to `broker`.
    pub fn new(broker: SharedBroker) -> Self {
        Self {
            broker,
            metrics: None,
        }
    }

    /// Attach metric handles.
    pub fn with_metrics(mut self, metrics: EventMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Broker this producer writes to.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Serialise and append `envelope` to `topic`, keyed for per-correlation ordering.
    pub async fn publish(&self, topic: Topic, envelope: &EventEnvelope) -> Result<RecordMeta> {
        let value = encode(envelope)?;
        let key = envelope.partition_key();
        let meta = self.broker.send(topic.as_str(), Some(&key), value).await?;
        debug!(
            topic = topic.as_str(),
            event_id = %envelope.event_id(),
            event_type = envelope.event_type(),
            partition = meta.partition,
            offset = meta.offset,
            "event published"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_published(topic.as_str());
        }
        Ok(meta)
    }
}
