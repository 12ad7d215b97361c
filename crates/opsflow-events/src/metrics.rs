//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use anyhow::Result;
use opsflow_metrics::SharedRegistry;
use prometheus::{IntCounterVec, Opts};

/// Counters exported by the event delivery pipeline.
#[derive(Clone)]
pub struct EventMetrics {
    registry: SharedRegistry,
    published_total: IntCounterVec,
    consumed_total: IntCounterVec,
    dead_lettered_total: IntCounterVec,
    replayed_total: IntCounterVec,
}

impl EventMetrics {
    /// Register the event metric families against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let published_total = IntCounterVec::new(
            Opts::new("opsflow_events_published_total", "Events published, by topic"),
            &["topic"],
        )?;
        registry.register(Box::new(published_total.clone()))?;

        let consumed_total = IntCounterVec::new(
            Opts::new(
                "opsflow_events_consumed_total",
                "Records consumed, by topic and handling outcome",
            ),
            &["topic", "outcome"],
        )?;
        registry.register(Box::new(consumed_total.clone()))?;

        let dead_lettered_total = IntCounterVec::new(
            Opts::new(
                "opsflow_events_dead_lettered_total",
                "Events moved to the dead-letter topic, by source topic",
            ),
            &["source_topic"],
        )?;
        registry.register(Box::new(dead_lettered_total.clone()))?;

        let replayed_total = IntCounterVec::new(
            Opts::new(
                "opsflow_events_replayed_total",
                "Dead-lettered events republished to their source topic",
            ),
            &["topic"],
        )?;
        registry.register(Box::new(replayed_total.clone()))?;

        Ok(Self {
            registry,
            published_total,
            consumed_total,
            dead_lettered_total,
            replayed_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub(crate) fn inc_published(&self, topic: &str) {
        self.published_total.with_label_values(&[topic]).inc();
    }

    pub(crate) fn inc_consumed(&self, topic: &str, outcome: &str) {
        self.consumed_total.with_label_values(&[topic, outcome]).inc();
    }

    pub(crate) fn inc_dead_lettered(&self, source_topic: &str) {
        self.dead_lettered_total
            .with_label_values(&[source_topic])
            .inc();
    }

    pub(crate) fn inc_replayed(&self, topic: &str) {
        self.replayed_total.with_label_values(&[topic]).inc();
    }
}

impl std::fmt::Debug for EventMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMetrics").finish_non_exhaustive()
    }
}
