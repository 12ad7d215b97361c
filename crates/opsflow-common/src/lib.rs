//! ---
//! ops_section: "01-core-functionality"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Shared primitives and utilities for the core runtime."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
//! Core shared primitives for the OpsFlow workspace.
//! This crate exposes configuration loading, tracing initialisation, and the
//! clock abstraction consumed by the resilience and event-delivery crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, BreakerOverride, BreakerProfile, BreakerSettings, BrokerKind, BrokerSettings,
    EventBusSettings, LoadedAppConfig, LoggingConfig, MetricsConfig, RetrySettings,
};
pub use logging::{init_tracing, init_tracing_with_default, LogFormat};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};
