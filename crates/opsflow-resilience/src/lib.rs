//! ---
//! ops_section: "07-resilience-fault-tolerance"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Circuit breaking, retry, and fail-closed gating."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Resilience primitives for calls to external dependencies: per-dependency
//! circuit breakers, a named registry, retry with exponential backoff, and a
//! fail-closed policy gate.

pub mod circuit_breaker;
pub mod error;
pub mod metrics;
pub mod policy_gate;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    BreakerGuard, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats,
};
pub use error::{CallError, CircuitOpenError, ResilienceError};
pub use metrics::{CallOutcome, ResilienceMetrics};
pub use policy_gate::{PolicyDecision, PolicyEngine, PolicyGate, PolicyRequest};
pub use registry::CircuitBreakerRegistry;
pub use retry::{
    not_circuit_open, retry_all, retry_on, retry_with_backoff, IsCircuitOpen, RecordingSleeper,
    Retrier, RetryPolicy, Sleeper, TokioSleeper,
};

/// Crate prelude collecting the most commonly used types.
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::{CallError, CircuitOpenError};
    pub use super::registry::CircuitBreakerRegistry;
    pub use super::retry::{not_circuit_open, retry_all, retry_on, Retrier, RetryPolicy};
}
