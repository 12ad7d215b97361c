//! ---
//! ops_section: "07-resilience-fault-tolerance"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Circuit breaking, retry, and fail-closed gating."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use anyhow::Result;
use opsflow_metrics::SharedRegistry;
use prometheus::{IntCounterVec, IntGaugeVec, Opts};

use crate::circuit_breaker::CircuitState;

/// Result of a single breaker admission, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Operation ran and succeeded.
    Success,
    /// Operation ran and failed.
    Failure,
    /// Operation was refused by the breaker.
    Rejected,
}

impl CallOutcome {
    /// Static label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Rejected => "rejected",
        }
    }
}

/// Metrics published by the resilience subsystem.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    breaker_calls_total: IntCounterVec,
    breaker_transitions_total: IntCounterVec,
    breaker_state: IntGaugeVec,
    retry_attempts_total: IntCounterVec,
    retry_exhausted_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let breaker_calls_total = IntCounterVec::new(
            Opts::new(
                "opsflow_breaker_calls_total",
                "Calls observed by circuit breakers, by outcome",
            ),
            &["breaker", "outcome"],
        )?;
        registry.register(Box::new(breaker_calls_total.clone()))?;

        let breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "opsflow_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["breaker", "from", "to"],
        )?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "opsflow_breaker_state",
                "Current breaker state (0 closed, 1 open, 2 half-open)",
            ),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new(
                "opsflow_retry_attempts_total",
                "Retries scheduled after a retryable failure",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_exhausted_total = IntCounterVec::new(
            Opts::new(
                "opsflow_retry_exhausted_total",
                "Operations that failed after exhausting every retry",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(retry_exhausted_total.clone()))?;

        Ok(Self {
            registry,
            breaker_calls_total,
            breaker_transitions_total,
            breaker_state,
            retry_attempts_total,
            retry_exhausted_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub(crate) fn record_call(&self, breaker: &str, outcome: CallOutcome) {
        self.breaker_calls_total
            .with_label_values(&[breaker, outcome.as_str()])
            .inc();
    }

    pub(crate) fn record_transition(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        self.breaker_transitions_total
            .with_label_values(&[breaker, from.as_str(), to.as_str()])
            .inc();
        self.set_state(breaker, to);
    }

    pub(crate) fn set_state(&self, breaker: &str, state: CircuitState) {
        self.breaker_state
            .with_label_values(&[breaker])
            .set(state.gauge_value());
    }

    pub(crate) fn inc_retry(&self, operation: &str) {
        self.retry_attempts_total
            .with_label_values(&[operation])
            .inc();
    }

    pub(crate) fn inc_exhausted(&self, operation: &str) {
        self.retry_exhausted_total
            .with_label_values(&[operation])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
