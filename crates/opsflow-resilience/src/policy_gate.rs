//! ---
//! ops_section: "07-resilience-fault-tolerance"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Circuit breaking, retry, and fail-closed gating."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
//! Fail-closed wrapper around an external policy engine.
//!
//! Every evaluation goes through a circuit breaker. When the breaker is open or
//! the engine errors, the gate denies the request instead of letting it through.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::CallError;

/// Authorization question forwarded to the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRequest {
    /// Principal performing the action.
    pub subject: String,
    /// Action being attempted.
    pub action: String,
    /// Target of the action.
    pub resource: String,
    /// Free-form attributes for the engine.
    #[serde(default)]
    pub context: Value,
}

impl PolicyRequest {
    /// Request without extra context.
    pub fn new(
        subject: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            action: action.into(),
            resource: resource.into(),
            context: Value::Null,
        }
    }
}

/// Verdict returned by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Human readable explanation.
    pub reason: String,
    /// Denied because the engine could not be consulted, not by policy.
    pub infrastructure: bool,
}

impl PolicyDecision {
    /// Engine allowed the request.
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            infrastructure: false,
        }
    }

    /// Engine denied the request.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            infrastructure: false,
        }
    }

    /// Gate denied the request because the engine was unreachable.
    pub fn infrastructure_denial(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            infrastructure: true,
        }
    }
}

/// External policy decision point.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate a single request.
    async fn evaluate(&self, request: &PolicyRequest) -> anyhow::Result<PolicyDecision>;
}

/// Breaker-protected, fail-closed policy evaluation.
pub struct PolicyGate<E> {
    engine: E,
    breaker: Arc<CircuitBreaker>,
}

impl<E: PolicyEngine> PolicyGate<E> {
    /// Wrap `engine` with `breaker`.
    pub fn new(engine: E, breaker: Arc<CircuitBreaker>) -> Self {
        Self { engine, breaker }
    }

    /// Breaker guarding the engine.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Evaluate `request`, denying whenever the engine cannot answer.
    pub async fn evaluate(&self, request: &PolicyRequest) -> PolicyDecision {
        match self.breaker.call(|| self.engine.evaluate(request)).await {
            Ok(decision) => decision,
            Err(CallError::Open(open)) => {
                warn!(
                    breaker = %open.name,
                    action = %request.action,
                    retry_after_seconds = open.retry_after_seconds(),
                    "policy evaluation denied: breaker open"
                );
                PolicyDecision::infrastructure_denial(format!(
                    "circuit breaker open for '{}': retry in {:.1}s",
                    open.name,
                    open.retry_after_seconds()
                ))
            }
            Err(CallError::Failed(err)) => {
                warn!(
                    breaker = %self.breaker.name(),
                    action = %request.action,
                    error = %format!("{err:#}"),
                    "policy evaluation denied: engine error"
                );
                PolicyDecision::infrastructure_denial(format!("policy engine unavailable: {err:#}"))
            }
        }
    }
}

impl<E> std::fmt::Debug for PolicyGate<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyGate")
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FlakyEngine {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PolicyEngine for FlakyEngine {
        async fn evaluate(&self, request: &PolicyRequest) -> anyhow::Result<PolicyDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            if request.action == "delete" {
                Ok(PolicyDecision::deny("delete is not permitted"))
            } else {
                Ok(PolicyDecision::allow("default allow"))
            }
        }
    }

    fn gate() -> PolicyGate<FlakyEngine> {
        let breaker = Arc::new(CircuitBreaker::new(
            "opa",
            CircuitBreakerConfig::new(1, Duration::from_secs(30)),
        ));
        PolicyGate::new(FlakyEngine::default(), breaker)
    }

    #[tokio::test]
    async fn engine_verdicts_pass_through() {
        let gate = gate();
        assert!(gate.evaluate(&PolicyRequest::new("alice", "read", "doc")).await.allowed);
        let denied = gate.evaluate(&PolicyRequest::new("alice", "delete", "doc")).await;
        assert!(!denied.allowed);
        assert!(!denied.infrastructure);
    }

    #[tokio::test]
    async fn fails_closed_when_engine_errors_then_breaker_opens() {
        let gate = gate();
        gate.engine.failing.store(true, Ordering::SeqCst);
        let request = PolicyRequest::new("bob", "read", "doc");

        let first = gate.evaluate(&request).await;
        assert!(!first.allowed);
        assert!(first.infrastructure);
        assert!(first.reason.starts_with("policy engine unavailable"));
        assert_eq!(gate.breaker().state(), CircuitState::Open);

        let second = gate.evaluate(&request).await;
        assert!(!second.allowed);
        assert!(second.reason.contains("circuit breaker open"));
        assert_eq!(gate.engine.calls.load(Ordering::SeqCst), 1);
    }
}
