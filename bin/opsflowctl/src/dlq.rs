//! ---
//! ops_section: "05-operator-interfaces"
//! ops_subsection: "binary"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Operator CLI for topics, configuration, publishing, and dead-letter replay."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Args, Subcommand};
use opsflow_events::DLQEnvelope;
use serde::Serialize;

use crate::Runtime;

/// Dispatch entry point for dead-letter subcommands.
pub async fn run(command: DlqCommand, runtime: &Runtime) -> Result<()> {
    match command {
        DlqCommand::List(cmd) => cmd.execute(runtime).await,
        DlqCommand::Replay(cmd) => cmd.execute(runtime).await,
    }
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// Print stored dead-letter records without consuming them.
    #[command(name = "list")]
    List(ListCommand),
    /// Republish dead-lettered events to the topic they failed on.
    ///
    /// Replay consumes every pending record in the DLQ consumer group, including the
    /// ones a filter rejects, so a filtered replay hides the rest from later replays.
    /// Run with --dry-run first to see what a filter selects.
    #[command(name = "replay")]
    Replay(ReplayCommand),
}

#[derive(Debug, Args)]
pub struct ListCommand {
    /// Maximum number of records to print, newest last.
    #[arg(long, value_name = "N", default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct ReplayCommand {
    /// Only replay events of this type.
    #[arg(long = "event-type", value_name = "TYPE")]
    event_type: Option<String>,

    /// Only replay events that failed on this topic.
    #[arg(long = "source-topic", value_name = "TOPIC")]
    source_topic: Option<String>,

    /// Only replay failures of this error type.
    #[arg(long = "error-type", value_name = "TYPE")]
    error_type: Option<String>,

    /// Show what would be replayed without consuming or publishing anything.
    #[arg(long = "dry-run", action = clap::ArgAction::SetTrue)]
    dry_run: bool,
}

/// Compact operator view of a dead-letter record.
#[derive(Debug, Serialize)]
struct EntrySummary<'a> {
    dlq_id: String,
    event_id: String,
    event_type: &'a str,
    source_topic: &'a str,
    error_type: &'a str,
    error_message: &'a str,
    retry_count: u32,
    failed_at: String,
}

impl<'a> From<&'a DLQEnvelope> for EntrySummary<'a> {
    fn from(entry: &'a DLQEnvelope) -> Self {
        Self {
            dlq_id: entry.dlq_id.to_string(),
            event_id: entry.original_event.event_id().to_string(),
            event_type: entry.original_event.event_type(),
            source_topic: &entry.source_topic,
            error_type: &entry.error_type,
            error_message: &entry.error_message,
            retry_count: entry.retry_count,
            failed_at: entry.failed_at.to_rfc3339(),
        }
    }
}

impl ListCommand {
    async fn execute(self, runtime: &Runtime) -> Result<()> {
        let bus = runtime.bus()?;
        let entries = bus.dlq_consumer().peek().await?;
        let skip = entries.len().saturating_sub(self.limit);
        for entry in entries.iter().skip(skip) {
            println!("{}", serde_json::to_string(&EntrySummary::from(entry))?);
        }
        eprintln!("{} of {} dead-letter records shown", entries.len() - skip, entries.len());
        Ok(())
    }
}

impl ReplayCommand {
    fn is_filtered(&self) -> bool {
        self.event_type.is_some() || self.source_topic.is_some() || self.error_type.is_some()
    }

    fn matches(&self, entry: &DLQEnvelope) -> bool {
        let event_type = self
            .event_type
            .as_deref()
            .map_or(true, |wanted| entry.original_event.event_type() == wanted);
        let source_topic = self
            .source_topic
            .as_deref()
            .map_or(true, |wanted| entry.source_topic == wanted);
        let error_type = self
            .error_type
            .as_deref()
            .map_or(true, |wanted| entry.error_type == wanted);
        event_type && source_topic && error_type
    }

    async fn execute(self, runtime: &Runtime) -> Result<()> {
        let bus = runtime.bus()?;
        let mut consumer = bus.dlq_consumer();

        if self.dry_run {
            let entries = consumer.peek().await?;
            let selected: Vec<_> = entries.iter().filter(|entry| self.matches(entry)).collect();
            for entry in &selected {
                println!("{}", serde_json::to_string(&EntrySummary::from(*entry))?);
            }
            eprintln!(
                "dry run: {} of {} dead-letter records would be replayed",
                selected.len(),
                entries.len()
            );
            return Ok(());
        }

        consumer.start();
        let filter: &(dyn Fn(&DLQEnvelope) -> bool + Send + Sync) =
            &|entry: &DLQEnvelope| self.matches(entry);
        let replayed = consumer.replay(bus.producer(), Some(filter)).await?;
        consumer.stop();
        if self.is_filtered() {
            eprintln!(
                "note: records rejected by the filter were consumed and will not be offered again"
            );
        }
        println!("{}", serde_json::json!({ "replayed": replayed }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsflow_events::{EventEnvelope, HandlerError};
    use serde_json::Map;

    fn entry(event_type: &str, source_topic: &str, error_type: &str) -> DLQEnvelope {
        DLQEnvelope::new(
            EventEnvelope::new(event_type, "test", Map::new()),
            &HandlerError::new(error_type, "boom"),
            source_topic,
            3,
            3,
        )
    }

    #[test]
    fn replay_filters_combine_with_and() {
        let cmd = ReplayCommand {
            event_type: Some("task.created".into()),
            source_topic: None,
            error_type: Some("TimeoutError".into()),
            dry_run: false,
        };
        assert!(cmd.matches(&entry("task.created", "opsflow.tracker.events", "TimeoutError")));
        assert!(!cmd.matches(&entry("task.created", "opsflow.tracker.events", "RuntimeError")));
        assert!(!cmd.matches(&entry("agent.started", "opsflow.agent.events", "TimeoutError")));
        assert!(cmd.is_filtered());
    }

    #[test]
    fn replay_help_warns_that_rejected_records_are_consumed() {
        use clap::CommandFactory;

        #[derive(Debug, clap::Parser)]
        struct Harness {
            #[command(subcommand)]
            dlq: DlqCommand,
        }

        let command = Harness::command();
        let replay = command.find_subcommand("replay").expect("replay subcommand");
        let about = replay.get_long_about().expect("long help").to_string();
        assert!(about.contains("hides the rest from later replays"));
    }
}
