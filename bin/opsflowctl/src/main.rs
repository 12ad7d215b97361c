//! ---
//! ops_section: "05-operator-interfaces"
//! ops_subsection: "binary"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Operator CLI for topics, configuration, publishing, and dead-letter replay."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser, Subcommand};
use opsflow_common::config::{AppConfig, BrokerKind};
use opsflow_common::logging::init_tracing_with_default;
use opsflow_events::{EventBus, EventMetrics, FileLogBroker, SharedBroker, Topic};
use opsflow_metrics::{new_registry, render_text, SharedRegistry};
use opsflow_resilience::{CircuitBreakerRegistry, ResilienceMetrics, RetryPolicy};
use tracing::debug;

mod dlq;
mod publish;

const CONFIG_CANDIDATES: &[&str] = &[
    "opsflow.toml",
    "configs/opsflow.toml",
    "/etc/opsflow/opsflow.toml",
];
const DEFAULT_BROKER_DIR: &str = ".opsflow/broker";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "OpsFlow event delivery and resilience control utility",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to OPSFLOW_CONFIG, then the usual locations).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the Prometheus metrics recorded by the command before exiting.
    #[arg(long = "print-metrics", global = true, action = ArgAction::SetTrue)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List every known topic.
    Topics,
    #[command(subcommand, about = "Configuration actions")]
    Config(ConfigCommand),
    /// Publish a single event.
    Publish(publish::PublishCommand),
    #[command(subcommand, about = "Dead-letter queue inspection and replay")]
    Dlq(dlq::DlqCommand),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Load and validate the configuration, then print a summary.
    Check,
}

/// Everything a subcommand needs, resolved once from the configuration.
pub(crate) struct Runtime {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
    pub registry: SharedRegistry,
    pub breakers: CircuitBreakerRegistry,
    pub resilience_metrics: ResilienceMetrics,
    event_metrics: EventMetrics,
}

impl Runtime {
    fn load(path: Option<&Path>) -> Result<Self> {
        let (config, source) = match path {
            Some(path) => {
                let loaded = AppConfig::load_with_source(&[path])?;
                (loaded.config, Some(loaded.source))
            }
            None => match AppConfig::load_with_source(CONFIG_CANDIDATES) {
                Ok(loaded) => (loaded.config, Some(loaded.source)),
                Err(err) => {
                    debug!(error = %err, "no configuration file found; using defaults");
                    (AppConfig::default(), None)
                }
            },
        };

        let registry = new_registry();
        let event_metrics = EventMetrics::new(registry.clone())?;
        let resilience_metrics = ResilienceMetrics::new(registry.clone())?;
        let breakers = CircuitBreakerRegistry::new().with_metrics(resilience_metrics.clone());
        breakers
            .register_from_settings(&config.breakers)
            .context("invalid breaker configuration")?;

        Ok(Self {
            config,
            source,
            registry,
            breakers,
            resilience_metrics,
            event_metrics,
        })
    }

    /// The CLI always talks to the on-disk broker so state survives between invocations.
    pub fn broker(&self) -> Result<SharedBroker> {
        let settings = &self.config.bus.broker;
        if settings.kind == BrokerKind::Memory {
            debug!("configured broker is in-memory; using the file log broker instead");
        }
        let directory = settings
            .directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BROKER_DIR));
        let broker = FileLogBroker::open(&directory)
            .with_context(|| format!("unable to open broker directory {}", directory.display()))?;
        Ok(Arc::new(broker))
    }

    pub fn bus(&self) -> Result<EventBus> {
        let bus = EventBus::new(self.broker()?, self.config.bus.clone())?;
        Ok(bus.with_metrics(self.event_metrics.clone()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.retry)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = Runtime::load(cli.config.as_deref())?;
    init_tracing_with_default("opsflowctl", &runtime.config.logging, DEFAULT_LOG_FILTER)?;

    match cli.command {
        Commands::Topics => {
            for topic in Topic::all() {
                println!("{}", topic.as_str());
            }
        }
        Commands::Config(ConfigCommand::Check) => check_config(&runtime)?,
        Commands::Publish(cmd) => publish::run(cmd, &runtime).await?,
        Commands::Dlq(cmd) => dlq::run(cmd, &runtime).await?,
    }

    if cli.print_metrics {
        print!("{}", render_text(&runtime.registry)?);
    }
    Ok(())
}

fn check_config(runtime: &Runtime) -> Result<()> {
    let config = &runtime.config;
    runtime.bus().context("event bus configuration rejected")?;
    let summary = serde_json::json!({
        "source": runtime.source.as_ref().map(|path| path.display().to_string()),
        "breakers": runtime.breakers.all_stats(),
        "breaker_defaults": {
            "failure_threshold": config.breakers.defaults.failure_threshold,
            "reset_timeout_seconds": config.breakers.defaults.reset_timeout.as_secs(),
            "half_open_max_calls": config.breakers.defaults.half_open_max_calls,
        },
        "retry": {
            "max_retries": config.retry.max_retries,
            "base_delay_ms": config.retry.base_delay.as_millis() as u64,
            "max_delay_ms": config.retry.max_delay.as_millis() as u64,
            "exponential_base": config.retry.exponential_base,
            "jitter": config.retry.jitter,
        },
        "bus": &config.bus,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("configuration OK");
    Ok(())
}
