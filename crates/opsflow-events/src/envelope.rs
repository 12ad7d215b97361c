//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{EventError, Result};

/// JSON object carried by an envelope.
pub type Payload = Map<String, Value>;

/// Immutable event record exchanged over the broker.
///
/// Identity is fixed at construction; equality compares `event_id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,
    event_type: String,
    source: String,
    payload: Payload,
    #[serde(default)]
    correlation_id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// New envelope with a fresh id and the current time.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// New envelope from an arbitrary JSON value, which must be an object.
    pub fn from_value(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Result<Self> {
        match payload {
            Value::Object(map) => Ok(Self::new(event_type, source, map)),
            other => Err(EventError::InvalidPayload(format!(
                "event payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Unique id assigned at construction.
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Dotted event type, e.g. `task.created`.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Producing component.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Event body.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Correlation id linking related events, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Construction time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Partitioning key: the correlation id when present, else the event id.
    pub fn partition_key(&self) -> String {
        match &self.correlation_id {
            Some(correlation_id) => correlation_id.clone(),
            None => self.event_id.to_string(),
        }
    }
}

impl PartialEq for EventEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for EventEnvelope {}

/// Failure reported by an event handler.
///
/// `kind` names the failing error type and is recorded as the DLQ `error_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Short error type name.
    pub kind: String,
    /// Human readable message.
    pub message: String,
}

impl HandlerError {
    /// Error with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an `anyhow` error, naming it after its root cause when that is known.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let kind = if err.root_cause().is::<std::io::Error>() {
            "IoError"
        } else {
            "Error"
        };
        Self::new(kind, format!("{err:#}"))
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Record describing an event that exhausted its delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DLQEnvelope {
    /// Id of this dead-letter record.
    pub dlq_id: Uuid,
    /// The event exactly as it was delivered.
    pub original_event: EventEnvelope,
    /// Message of the last failure.
    pub error_message: String,
    /// Type name of the last failure.
    pub error_type: String,
    /// Topic the event was consumed from.
    pub source_topic: String,
    /// Failed deliveries before dead-lettering.
    pub retry_count: u32,
    /// Retry budget of the dead-letter queue at the time.
    pub max_retries: u32,
    /// When the event was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

impl DLQEnvelope {
    /// Wrap a failed event.
    pub fn new(
        original_event: EventEnvelope,
        error: &HandlerError,
        source_topic: impl Into<String>,
        retry_count: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            dlq_id: Uuid::new_v4(),
            original_event,
            error_message: error.message.clone(),
            error_type: error.kind.clone(),
            source_topic: source_topic.into(),
            retry_count,
            max_retries,
            failed_at: Utc::now(),
        }
    }

    /// Encode as the payload of a carrier envelope.
    pub fn to_payload(&self) -> Result<Payload> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(EventError::InvalidPayload(format!(
                "dead-letter record encoded as {}",
                json_kind(&other)
            ))),
        }
    }

    /// Decode from the payload of a carrier envelope.
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(payload.clone()))?)
    }
}
