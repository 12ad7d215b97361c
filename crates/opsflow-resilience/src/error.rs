//! ---
//! ops_section: "07-resilience-fault-tolerance"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Circuit breaking, retry, and fail-closed gating."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

/// Raised when a breaker refuses to run the guarded operation.
///
/// Rejections are never counted as failures against the breaker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{name}' is open; retry after {:.1}s", .retry_after.as_secs_f64())]
pub struct CircuitOpenError {
    /// Name of the rejecting breaker.
    pub name: String,
    /// Remaining time until the breaker admits a half-open probe.
    pub retry_after: Duration,
}

impl CircuitOpenError {
    /// Remaining cool-down expressed in seconds.
    pub fn retry_after_seconds(&self) -> f64 {
        self.retry_after.as_secs_f64()
    }
}

/// Outcome of a call executed through [`crate::CircuitBreaker::call`].
#[derive(Debug)]
pub enum CallError<E> {
    /// The breaker rejected the call without executing it.
    Open(CircuitOpenError),
    /// The operation ran and failed; the failure has been recorded.
    Failed(E),
}

impl<E> CallError<E> {
    /// Whether the call was rejected by an open breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open(_))
    }

    /// Borrow the rejection details, if any.
    pub fn as_open(&self) -> Option<&CircuitOpenError> {
        match self {
            CallError::Open(err) => Some(err),
            CallError::Failed(_) => None,
        }
    }

    /// Extract the operation's own error, if it ran.
    pub fn into_failed(self) -> Option<E> {
        match self {
            CallError::Failed(err) => Some(err),
            CallError::Open(_) => None,
        }
    }

    /// Flatten into an `anyhow::Error`, keeping the rejection as a downcastable cause.
    pub fn into_anyhow(self) -> anyhow::Error
    where
        E: Into<anyhow::Error>,
    {
        match self {
            CallError::Open(err) => anyhow::Error::new(err),
            CallError::Failed(err) => err.into(),
        }
    }
}

impl<E> From<CircuitOpenError> for CallError<E> {
    fn from(err: CircuitOpenError) -> Self {
        CallError::Open(err)
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Open(err) => fmt::Display::fmt(err, f),
            CallError::Failed(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl<E> std::error::Error for CallError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Open(err) => Some(err),
            CallError::Failed(err) => Some(err),
        }
    }
}

/// Errors raised by registry level operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    /// No breaker has been registered under the requested name.
    #[error("no circuit breaker registered under '{0}'")]
    UnknownBreaker(String),
    /// Breaker or retry settings failed validation.
    #[error("invalid resilience configuration: {0}")]
    InvalidConfig(String),
}
