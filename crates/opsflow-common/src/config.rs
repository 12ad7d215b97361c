//! ---
//! ops_section: "01-core-functionality"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Shared primitives and utilities for the core runtime."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_enable_dlq() -> bool {
    true
}

fn default_group_id() -> String {
    "opsflow-core".to_owned()
}

fn default_dlq_group_id() -> String {
    "opsflow-dlq".to_owned()
}

fn default_max_poll_records() -> usize {
    100
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_partitions() -> u32 {
    3
}

/// Primary configuration object for OpsFlow services embedding the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub breakers: BreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub bus: EventBusSettings,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "OPSFLOW_CONFIG";

    /// Load configuration from disk, respecting the `OPSFLOW_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.breakers.validate()?;
        self.retry.validate()?;
        self.bus.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

/// Circuit breaker parameters for one dependency.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerProfile {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reset_timeout: Duration,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerProfile {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Partial profile applied on top of the defaults for a named dependency.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub reset_timeout: Option<Duration>,
    #[serde(default)]
    pub half_open_max_calls: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(flatten)]
    pub defaults: BreakerProfile,
    #[serde(default)]
    pub overrides: IndexMap<String, BreakerOverride>,
}

impl BreakerSettings {
    /// Effective profile for the named dependency.
    pub fn profile_for(&self, name: &str) -> BreakerProfile {
        let mut profile = self.defaults;
        if let Some(custom) = self.overrides.get(name) {
            if let Some(threshold) = custom.failure_threshold {
                profile.failure_threshold = threshold;
            }
            if let Some(timeout) = custom.reset_timeout {
                profile.reset_timeout = timeout;
            }
            if let Some(probes) = custom.half_open_max_calls {
                profile.half_open_max_calls = probes;
            }
        }
        profile
    }

    pub fn validate(&self) -> Result<()> {
        let profiles = std::iter::once(("defaults", self.defaults)).chain(
            self.overrides
                .keys()
                .map(|name| (name.as_str(), self.profile_for(name))),
        );
        for (name, profile) in profiles {
            if profile.failure_threshold == 0 {
                return Err(anyhow!(
                    "breaker '{}' must have a failure_threshold of at least 1",
                    name
                ));
            }
            if profile.half_open_max_calls == 0 {
                return Err(anyhow!(
                    "breaker '{}' must admit at least one half-open probe",
                    name
                ));
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<()> {
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(anyhow!(
                "retry exponential_base must be a finite value >= 1.0 (got {})",
                self.exponential_base
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(anyhow!(
                "retry base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay.as_millis(),
                self.max_delay.as_millis()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub kind: BrokerKind,
    /// Log directory for the file broker.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            directory: None,
            partitions: default_partitions(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusSettings {
    #[serde(default = "default_enable_dlq")]
    pub enable_dlq: bool,
    /// Failures tolerated per event before it is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_dlq_group_id")]
    pub dlq_group_id: String,
    /// Topics consumed by the bus; every application topic when empty.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
    #[serde(rename = "poll_interval_ms", default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub broker: BrokerSettings,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            enable_dlq: default_enable_dlq(),
            max_retries: default_max_retries(),
            group_id: default_group_id(),
            dlq_group_id: default_dlq_group_id(),
            topics: Vec::new(),
            max_poll_records: default_max_poll_records(),
            poll_interval: default_poll_interval(),
            broker: BrokerSettings::default(),
        }
    }
}

impl EventBusSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_poll_records == 0 {
            return Err(anyhow!("bus max_poll_records must be at least 1"));
        }
        if self.group_id.trim().is_empty() || self.dlq_group_id.trim().is_empty() {
            return Err(anyhow!("bus consumer group identifiers must not be empty"));
        }
        if self.group_id == self.dlq_group_id {
            return Err(anyhow!(
                "bus group_id and dlq_group_id must differ (both '{}')",
                self.group_id
            ));
        }
        if self.broker.partitions == 0 {
            return Err(anyhow!("bus broker must have at least one partition"));
        }
        if self.broker.kind == BrokerKind::File && self.broker.directory.is_none() {
            return Err(anyhow!("file broker requires bus.broker.directory"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_str("").expect("defaults are valid");
        assert_eq!(config.breakers.defaults.failure_threshold, 5);
        assert_eq!(config.breakers.defaults.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.bus.enable_dlq);
        assert_eq!(config.bus.broker.kind, BrokerKind::Memory);
    }

    #[test]
    fn breaker_overrides_layer_on_defaults() {
        let config = AppConfig::from_str(
            r#"
            [breakers]
            failure_threshold = 4
            reset_timeout = 10

            [breakers.overrides.opa]
            failure_threshold = 1
            "#,
        )
        .expect("valid config");

        let opa = config.breakers.profile_for("opa");
        assert_eq!(opa.failure_threshold, 1);
        assert_eq!(opa.reset_timeout, Duration::from_secs(10));
        assert_eq!(opa.half_open_max_calls, 1);

        let other = config.breakers.profile_for("postgres");
        assert_eq!(other.failure_threshold, 4);
    }

    #[test]
    fn retry_durations_parse_as_milliseconds() {
        let config = AppConfig::from_str(
            r#"
            [retry]
            max_retries = 2
            base_delay_ms = 250
            max_delay_ms = 2000
            jitter = false
            "#,
        )
        .expect("valid config");
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_secs(2));
        assert!(!config.retry.jitter);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(AppConfig::from_str("[breakers]\nfailure_threshold = 0\n").is_err());
        assert!(AppConfig::from_str("[retry]\nexponential_base = 0.5\n").is_err());
        assert!(
            AppConfig::from_str("[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 10\n").is_err()
        );
        assert!(AppConfig::from_str("[bus.broker]\nkind = \"file\"\n").is_err());
        assert!(AppConfig::from_str("[bus]\ndlq_group_id = \"opsflow-core\"\n").is_err());
    }

    #[test]
    fn sample_configuration_is_valid() {
        let config = AppConfig::from_str(include_str!("../../../configs/opsflow.example.toml"))
            .expect("sample config parses");
        assert_eq!(config.breakers.profile_for("opa").failure_threshold, 3);
        assert_eq!(
            config.breakers.profile_for("broker").reset_timeout,
            Duration::from_secs(15)
        );
        assert_eq!(config.bus.broker.kind, BrokerKind::File);
        assert_eq!(config.bus.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn load_prefers_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("opsflow.toml");
        std::fs::write(&path, "[bus]\nmax_retries = 7\n").expect("write config");

        let missing = dir.path().join("missing.toml");
        let loaded =
            AppConfig::load_with_source(&[missing, path.clone()]).expect("config loads");
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.bus.max_retries, 7);
    }
}
