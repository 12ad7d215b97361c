//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Event delivery on top of a pluggable [`Broker`]: envelopes and topics, a
//! producer, a consumer with per-event retry counting, the dead-letter queue,
//! and a DLQ consumer able to replay failed events.

pub mod broker;
pub mod bus;
pub mod consumer;
pub mod dlq;
pub mod dlq_consumer;
pub mod envelope;
pub mod file_broker;
pub mod metrics;
pub mod producer;
pub mod topics;

/// Shared result type for event delivery operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised while moving events through a broker.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The broker refused or failed an operation.
    #[error("broker error: {0}")]
    Broker(String),
    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A topic name did not match any known topic.
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    /// Payload had the wrong shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

pub use broker::{connect, Broker, InMemoryBroker, Record, RecordMeta, SharedBroker};
pub use bus::EventBus;
pub use consumer::{ConsumeReport, EventConsumer};
pub use dlq::DeadLetterQueue;
pub use dlq_consumer::DLQConsumer;
pub use envelope::{DLQEnvelope, EventEnvelope, HandlerError, Payload};
pub use file_broker::FileLogBroker;
pub use metrics::EventMetrics;
pub use producer::EventProducer;
pub use topics::{decode, encode, Topic, DLQ_TOPIC};
