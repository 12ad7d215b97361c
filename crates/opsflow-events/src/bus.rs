//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::sync::Arc;

use opsflow_common::config::EventBusSettings;
use tracing::info;

use crate::broker::{RecordMeta, SharedBroker};
use crate::consumer::EventConsumer;
use crate::dlq::DeadLetterQueue;
use crate::dlq_consumer::DLQConsumer;
use crate::envelope::EventEnvelope;
use crate::metrics::EventMetrics;
use crate::producer::EventProducer;
use crate::topics::Topic;
use crate::Result;

/// Producer, consumer, and dead-letter queue wired to one broker.
#[derive(Debug)]
pub struct EventBus {
    broker: SharedBroker,
    settings: EventBusSettings,
    topics: Vec<Topic>,
    producer: EventProducer,
    consumer: EventConsumer,
    dlq: Option<Arc<DeadLetterQueue>>,
    metrics: Option<EventMetrics>,
}

impl EventBus {
    /// Assemble a bus from settings.
    ///
    /// An empty `topics` list subscribes to every application topic.
    pub fn new(broker: SharedBroker, settings: EventBusSettings) -> Result<Self> {
        let topics = if settings.topics.is_empty() {
            Topic::application()
        } else {
            settings
                .topics
                .iter()
                .map(|name| Topic::parse(name))
                .collect::<Result<Vec<_>>>()?
        };
        let bus = Self::assemble(broker, settings, topics, None);
        info!(
            broker = bus.broker.name(),
            group = %bus.settings.group_id,
            dlq_enabled = bus.dlq.is_some(),
            "event bus assembled"
        );
        Ok(bus)
    }

    /// Rebuild every component with metric handles attached.
    pub fn with_metrics(self, metrics: EventMetrics) -> Self {
        Self::assemble(self.broker, self.settings, self.topics, Some(metrics))
    }

    fn assemble(
        broker: SharedBroker,
        settings: EventBusSettings,
        topics: Vec<Topic>,
        metrics: Option<EventMetrics>,
    ) -> Self {
        let mut producer = EventProducer::new(broker.clone());
        if let Some(metrics) = &metrics {
            producer = producer.with_metrics(metrics.clone());
        }

        let dlq = settings.enable_dlq.then(|| {
            let mut dlq = DeadLetterQueue::new(producer.clone(), settings.max_retries);
            if let Some(metrics) = &metrics {
                dlq = dlq.with_metrics(metrics.clone());
            }
            Arc::new(dlq)
        });

        let mut consumer = EventConsumer::new(broker.clone(), &topics, settings.group_id.clone())
            .with_max_poll_records(settings.max_poll_records)
            .with_poll_interval(settings.poll_interval);
        if let Some(dlq) = &dlq {
            consumer = consumer.with_dlq(dlq.clone());
        }
        if let Some(metrics) = &metrics {
            consumer = consumer.with_metrics(metrics.clone());
        }

        Self {
            broker,
            settings,
            topics,
            producer,
            consumer,
            dlq,
            metrics,
        }
    }

    /// Underlying broker.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Settings the bus was built from.
    pub fn settings(&self) -> &EventBusSettings {
        &self.settings
    }

    /// Shared producer.
    pub fn producer(&self) -> &EventProducer {
        &self.producer
    }

    /// Application consumer.
    pub fn consumer(&self) -> &EventConsumer {
        &self.consumer
    }

    /// Application consumer, for polling.
    pub fn consumer_mut(&mut self) -> &mut EventConsumer {
        &mut self.consumer
    }

    /// Dead-letter queue, when enabled.
    pub fn dlq(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dlq.as_ref()
    }

    /// Fresh dead-letter consumer in the configured DLQ group.
    pub fn dlq_consumer(&self) -> DLQConsumer {
        let consumer = DLQConsumer::new(self.broker.clone(), self.settings.dlq_group_id.clone())
            .with_max_poll_records(self.settings.max_poll_records);
        match &self.metrics {
            Some(metrics) => consumer.with_metrics(metrics.clone()),
            None => consumer,
        }
    }

    /// Publish through the bus producer.
    pub async fn publish(&self, topic: Topic, envelope: &EventEnvelope) -> Result<RecordMeta> {
        self.producer.publish(topic, envelope).await
    }
}
