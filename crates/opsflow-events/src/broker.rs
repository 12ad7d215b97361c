//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use opsflow_common::config::{BrokerKind, BrokerSettings};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::file_broker::FileLogBroker;
use crate::topics::Topic;
use crate::{EventError, Result};

/// A record read back from a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Topic the record was appended to.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Partitioning key supplied by the producer.
    pub key: Option<String>,
    /// Encoded envelope.
    pub value: Bytes,
    /// Append time.
    pub timestamp: DateTime<Utc>,
}

/// Position assigned to an appended record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Topic the record was appended to.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
}

/// Append-only, partitioned log with consumer-group offsets.
///
/// `fetch` commits the returned records for the group before returning them.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    /// Append `value` to `topic`, choosing the partition from `key`.
    async fn send(&self, topic: &str, key: Option<&str>, value: Bytes) -> Result<RecordMeta>;
    /// Return up to `max_records` records past the group's offsets and advance them.
    async fn fetch(
        &self,
        topics: &[String],
        group: &str,
        max_records: usize,
    ) -> Result<Vec<Record>>;
    /// Every record currently stored for `topic`, without touching any offsets.
    async fn records(&self, topic: &str) -> Result<Vec<Record>>;
    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Shared broker handle.
pub type SharedBroker = Arc<dyn Broker>;

/// Build the broker described by `settings`.
pub fn connect(settings: &BrokerSettings) -> Result<SharedBroker> {
    let broker: SharedBroker = match settings.kind {
        BrokerKind::Memory => Arc::new(InMemoryBroker::new(settings.partitions)),
        BrokerKind::File => {
            let directory = settings.directory.as_ref().ok_or_else(|| {
                EventError::Broker("file broker requires bus.broker.directory".into())
            })?;
            Arc::new(FileLogBroker::open(directory)?)
        }
    };
    info!(broker = broker.name(), "event broker connected");
    Ok(broker)
}

pub(crate) fn partition_for(key: Option<&str>, partitions: u32) -> u32 {
    match key {
        Some(key) if partitions > 1 => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % u64::from(partitions)) as u32
        }
        _ => 0,
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    offsets: HashMap<(String, String, u32), u64>,
}

/// Process-local broker for tests and single-process deployments.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    partitions: u32,
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryBroker {
    /// Broker creating topics with `partitions` partitions on first use.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Create every known topic up front.
    pub fn provision(&self) {
        let mut state = self.state.lock();
        for topic in Topic::all() {
            state
                .topics
                .entry(topic.as_str().to_owned())
                .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        }
    }

    /// Topics that exist so far.
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stored records for `topic`, partition by partition.
    pub fn snapshot(&self, topic: &str) -> Vec<Record> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(&self, topic: &str, key: Option<&str>, value: Bytes) -> Result<RecordMeta> {
        let partition = partition_for(key, self.partitions);
        let mut state = self.state.lock();
        let partitions = state
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        let log = partitions
            .get_mut(partition as usize)
            .ok_or_else(|| {
                EventError::Broker(format!("partition {partition} missing on {topic}"))
            })?;
        let offset = log.len() as u64;
        log.push(Record {
            topic: topic.to_owned(),
            partition,
            offset,
            key: key.map(str::to_owned),
            value,
            timestamp: Utc::now(),
        });
        debug!(topic, partition, offset, "record appended");
        Ok(RecordMeta {
            topic: topic.to_owned(),
            partition,
            offset,
        })
    }

    async fn fetch(
        &self,
        topics: &[String],
        group: &str,
        max_records: usize,
    ) -> Result<Vec<Record>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut batch = Vec::new();
        for topic in topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (index, log) in partitions.iter().enumerate() {
                if batch.len() >= max_records {
                    return Ok(batch);
                }
                let partition = index as u32;
                let position = state
                    .offsets
                    .entry((group.to_owned(), topic.clone(), partition))
                    .or_insert(0);
                let start = *position as usize;
                let take = (max_records - batch.len()).min(log.len().saturating_sub(start));
                batch.extend(log[start..start + take].iter().cloned());
                *position += take as u64;
            }
        }
        Ok(batch)
    }

    async fn records(&self, topic: &str) -> Result<Vec<Record>> {
        Ok(self.snapshot(topic))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn groups_track_offsets_independently() {
        let broker = InMemoryBroker::new(1);
        for n in 0..3 {
            broker
                .send("t", Some("k"), Bytes::from(format!("m{n}")))
                .await
                .expect("send");
        }
        let first = broker.fetch(&topics(&["t"]), "a", 2).await.expect("fetch");
        assert_eq!(first.len(), 2);
        let rest = broker.fetch(&topics(&["t"]), "a", 10).await.expect("fetch");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].offset, 2);
        assert!(broker.fetch(&topics(&["t"]), "a", 10).await.expect("fetch").is_empty());

        let other = broker.fetch(&topics(&["t"]), "b", 10).await.expect("fetch");
        assert_eq!(other.len(), 3);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let broker = InMemoryBroker::new(4);
        let a = broker.send("t", Some("corr-7"), Bytes::from_static(b"1")).await.expect("send");
        let b = broker.send("t", Some("corr-7"), Bytes::from_static(b"2")).await.expect("send");
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[test]
    fn provision_creates_every_topic() {
        let broker = InMemoryBroker::new(2);
        broker.provision();
        assert_eq!(broker.topic_names().len(), Topic::all().len());
        assert!(broker.snapshot(crate::DLQ_TOPIC).is_empty());
    }

    #[test]
    fn file_kind_requires_directory() {
        let settings = BrokerSettings {
            kind: BrokerKind::File,
            directory: None,
            partitions: 1,
        };
        assert!(matches!(connect(&settings), Err(EventError::Broker(_))));
    }
}
