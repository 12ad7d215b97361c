//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::envelope::EventEnvelope;
use crate::{EventError, Result};

/// Name of the dead-letter topic.
pub const DLQ_TOPIC: &str = "opsflow.dlq";

/// Closed set of topics the platform publishes to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum Topic {
    /// Work item tracker events.
    #[strum(serialize = "opsflow.tracker.events")]
    #[serde(rename = "opsflow.tracker.events")]
    TrackerEvents,
    /// Agent lifecycle and activity events.
    #[strum(serialize = "opsflow.agent.events")]
    #[serde(rename = "opsflow.agent.events")]
    AgentEvents,
    /// Recorded policy decisions.
    #[strum(serialize = "opsflow.policy.decisions")]
    #[serde(rename = "opsflow.policy.decisions")]
    PolicyDecisions,
    /// Outbound notifications.
    #[strum(serialize = "opsflow.notifications")]
    #[serde(rename = "opsflow.notifications")]
    Notifications,
    /// Events that exhausted their delivery attempts.
    #[strum(serialize = "opsflow.dlq")]
    #[serde(rename = "opsflow.dlq")]
    DeadLetter,
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Every topic, dead-letter included; used when provisioning a broker.
    pub fn all() -> Vec<Topic> {
        Topic::iter().collect()
    }

    /// Topics carrying application events, i.e. everything but the dead-letter topic.
    pub fn application() -> Vec<Topic> {
        Topic::iter().filter(|topic| *topic != Topic::DeadLetter).collect()
    }

    /// Parse a wire name, reporting unknown names as [`EventError::UnknownTopic`].
    pub fn parse(name: &str) -> Result<Topic> {
        Topic::from_str(name).map_err(|_| EventError::UnknownTopic(name.to_owned()))
    }
}

/// Serialise an envelope for the wire.
pub fn encode(envelope: &EventEnvelope) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Deserialise an envelope from the wire.
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope> {
    Ok(serde_json::from_slice(bytes)?)
}
