//! ---
//! ops_section: "05-operator-interfaces"
//! ops_subsection: "binary"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Operator CLI for topics, configuration, publishing, and dead-letter replay."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use clap::Args;
use opsflow_events::{EventEnvelope, Topic};
use opsflow_resilience::{not_circuit_open, Retrier};
use serde_json::Value;

use crate::Runtime;

const BROKER_BREAKER: &str = "broker";

#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Destination topic, e.g. opsflow.tracker.events.
    #[arg(long, value_name = "TOPIC")]
    topic: String,

    /// Dotted event type, e.g. task.created.
    #[arg(long = "event-type", value_name = "TYPE")]
    event_type: String,

    /// Producing component recorded on the envelope.
    #[arg(long, value_name = "NAME", default_value = "opsflowctl")]
    source: String,

    /// JSON object used as the event payload.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    payload: String,

    /// Correlation id linking related events.
    #[arg(long = "correlation-id", value_name = "ID")]
    correlation_id: Option<String>,
}

pub async fn run(cmd: PublishCommand, runtime: &Runtime) -> Result<()> {
    let topic = Topic::parse(&cmd.topic)?;
    let payload: Value = serde_json::from_str(&cmd.payload).context("--payload is not valid JSON")?;
    let mut envelope = EventEnvelope::from_value(cmd.event_type, cmd.source, payload)?;
    if let Some(correlation_id) = cmd.correlation_id {
        envelope = envelope.with_correlation_id(correlation_id);
    }

    let bus = runtime.bus()?;
    let breaker = runtime
        .breakers
        .register(BROKER_BREAKER, runtime.config.breakers.profile_for(BROKER_BREAKER).into());
    let retrier = Retrier::new(runtime.retry_policy())
        .named("opsflowctl.publish")
        .with_metrics(runtime.resilience_metrics.clone());
    let meta = retrier
        .run(
            |_| {
                let breaker = breaker.clone();
                let bus = &bus;
                let envelope = &envelope;
                async move { breaker.call(|| bus.publish(topic, envelope)).await }
            },
            not_circuit_open,
        )
        .await
        .map_err(|err| err.into_anyhow())
        .context("publish failed")?;

    println!(
        "{}",
        serde_json::json!({
            "event_id": envelope.event_id(),
            "topic": meta.topic,
            "partition": meta.partition,
            "offset": meta.offset,
        })
    );
    Ok(())
}
