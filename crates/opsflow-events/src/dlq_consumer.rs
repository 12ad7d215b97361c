//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::future::Future;

use tracing::{debug, error, info, warn};

use crate::broker::{Record, SharedBroker};
use crate::envelope::{DLQEnvelope, HandlerError};
use crate::metrics::EventMetrics;
use crate::producer::EventProducer;
use crate::topics::{decode, Topic};
use crate::Result;

const DEFAULT_MAX_POLL_RECORDS: usize = 100;

/// Reader of the dead-letter topic for inspection and replay.
#[derive(Debug)]
pub struct DLQConsumer {
    broker: SharedBroker,
    topics: Vec<String>,
    group_id: String,
    max_poll_records: usize,
    running: bool,
    metrics: Option<EventMetrics>,
}

impl DLQConsumer {
    /// Stopped consumer of the dead-letter topic in `group_id`.
    pub fn new(broker: SharedBroker, group_id: impl Into<String>) -> Self {
        Self {
            broker,
            topics: vec![Topic::DeadLetter.as_str().to_owned()],
            group_id: group_id.into(),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            running: false,
            metrics: None,
        }
    }

    /// Upper bound on records per poll.
    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records.max(1);
        self
    }

    /// Attach metric handles.
    pub fn with_metrics(mut self, metrics: EventMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Begin consuming. Calling it again has no effect.
    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            info!(group = %self.group_id, "dead-letter consumer started");
        }
    }

    /// Stop consuming. A no-op when not started.
    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!(group = %self.group_id, "dead-letter consumer stopped");
        }
    }

    /// Whether [`DLQConsumer::start`] is in effect.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Hand every available dead-letter record to `handler`; returns how many it accepted.
    ///
    /// Undecodable records and handler failures are logged and skipped. Each fetched
    /// batch is fully handled before the next fetch, so a broker error only loses
    /// the count, never a committed record.
    pub async fn consume<H, Fut>(&mut self, mut handler: H) -> Result<usize>
    where
        H: FnMut(DLQEnvelope) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        if !self.running {
            return Ok(0);
        }
        let mut handled = 0;
        while let Some(entries) = self.next_batch().await? {
            for entry in entries {
                let dlq_id = entry.dlq_id;
                match handler(entry).await {
                    Ok(()) => handled += 1,
                    Err(err) => {
                        warn!(%dlq_id, error = %err, "dead-letter handler failed; skipping")
                    }
                }
            }
        }
        Ok(handled)
    }

    /// Republish the original event of every available record accepted by `filter`.
    ///
    /// Records rejected by the filter are consumed all the same. Returns the number
    /// of events actually republished. Batches are republished as they are fetched.
    pub async fn replay(
        &mut self,
        producer: &EventProducer,
        filter: Option<&(dyn Fn(&DLQEnvelope) -> bool + Send + Sync)>,
    ) -> Result<usize> {
        if !self.running {
            return Ok(0);
        }
        let mut replayed = 0;
        while let Some(entries) = self.next_batch().await? {
            for entry in entries {
                if filter.map_or(true, |keep| keep(&entry)) {
                    if self.replay_entry(producer, &entry).await {
                        replayed += 1;
                    }
                } else {
                    debug!(dlq_id = %entry.dlq_id, "dead-letter record filtered out of replay");
                }
            }
        }
        Ok(replayed)
    }

    /// Decode every stored dead-letter record without committing anything.
    pub async fn peek(&self) -> Result<Vec<DLQEnvelope>> {
        let records = self.broker.records(Topic::DeadLetter.as_str()).await?;
        Ok(records.iter().filter_map(decode_entry).collect())
    }

    async fn replay_entry(&self, producer: &EventProducer, entry: &DLQEnvelope) -> bool {
        let topic = match Topic::parse(&entry.source_topic) {
            Ok(topic) => topic,
            Err(err) => {
                warn!(dlq_id = %entry.dlq_id, error = %err, "cannot replay to unknown topic");
                return false;
            }
        };
        match producer.publish(topic, &entry.original_event).await {
            Ok(_) => {
                info!(
                    dlq_id = %entry.dlq_id,
                    event_id = %entry.original_event.event_id(),
                    topic = topic.as_str(),
                    "dead-letter record replayed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_replayed(topic.as_str());
                }
                true
            }
            Err(err) => {
                error!(
                    dlq_id = %entry.dlq_id,
                    topic = topic.as_str(),
                    error = %err,
                    "replay publish failed"
                );
                false
            }
        }
    }

    /// One fetch; `None` once the group has caught up.
    async fn next_batch(&mut self) -> Result<Option<Vec<DLQEnvelope>>> {
        let records = self
            .broker
            .fetch(&self.topics, &self.group_id, self.max_poll_records)
            .await?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records.iter().filter_map(decode_entry).collect()))
    }
}

fn decode_entry(record: &Record) -> Option<DLQEnvelope> {
    let decoded =
        decode(&record.value).and_then(|carrier| DLQEnvelope::from_payload(carrier.payload()));
    match decoded {
        Ok(entry) => Some(entry),
        Err(err) => {
            warn!(
                offset = record.offset,
                error = %err,
                "skipping undecodable dead-letter record"
            );
            None
        }
    }
}
