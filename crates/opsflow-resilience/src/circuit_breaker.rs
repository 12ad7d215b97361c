//! ---
//! ops_section: "07-resilience-fault-tolerance"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Circuit breaking, retry, and fail-closed gating."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
//! Per-dependency circuit breaker.
//!
//! The breaker is a one-way ratchet while closed: successes never pay down the
//! failure count, so a dependency that keeps flapping still trips eventually.
//! The open to half-open transition is evaluated lazily whenever the state is
//! observed or a call is admitted; no background timer is involved.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opsflow_common::config::BreakerProfile;
use opsflow_common::time::{SharedClock, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CallError, CircuitOpenError};
use crate::metrics::{CallOutcome, ResilienceMetrics};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow through and failures are counted.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// A bounded number of probe calls decide whether to close again.
    HalfOpen,
}

impl CircuitState {
    /// Static label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub(crate) fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures (since the last close) that trip the breaker.
    pub failure_threshold: u32,
    /// Cool-down before a tripped breaker admits probes.
    pub reset_timeout: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    /// Construct a configuration admitting a single half-open probe.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            half_open_max_calls: 1,
        }
    }

    /// Adjust the half-open probe budget.
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls.max(1);
        self
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl From<BreakerProfile> for CircuitBreakerConfig {
    fn from(profile: BreakerProfile) -> Self {
        Self::new(profile.failure_threshold, profile.reset_timeout)
            .with_half_open_max_calls(profile.half_open_max_calls)
    }
}

/// Read-only snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    /// Breaker name.
    pub name: String,
    /// State after applying the lazy half-open transition.
    pub state: CircuitState,
    /// Failures since the breaker last closed.
    pub failure_count: u32,
    /// Successful calls over the breaker's lifetime.
    pub success_count: u64,
    /// Admitted calls over the breaker's lifetime.
    pub total_calls: u64,
    /// Wall-clock time of the most recent failure.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent success.
    pub last_success_time: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent trip, cleared by `reset`.
    pub opened_at: Option<DateTime<Utc>>,
    /// Probes admitted in the current half-open window.
    pub half_open_calls: u32,
    /// Configured trip threshold.
    pub failure_threshold: u32,
    /// Configured cool-down in seconds.
    pub reset_timeout_seconds: f64,
    /// Configured probe budget.
    pub half_open_max_calls: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    total_calls: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    half_open_calls: u32,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            last_failure_time: None,
            last_success_time: None,
            opened_at: None,
            opened_at_utc: None,
            half_open_calls: 0,
        }
    }
}

/// Circuit breaker guarding a single named dependency.
///
/// All counters and transitions sit behind one lock so concurrent callers never
/// under-count failures. The guarded operation itself runs outside the lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    metrics: Option<ResilienceMetrics>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker using the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            clock: SystemClock::shared(),
            metrics: None,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attach metric handles.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        metrics.set_state(&self.name, self.inner.get_mut().state);
        self.metrics = Some(metrics);
        self
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the lazy open to half-open transition.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    /// Remaining cool-down while open; `None` in any other state.
    pub fn retry_after(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            CircuitState::Open => Some(self.remaining_cooldown(&inner, now)),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        }
    }

    /// Snapshot of counters and configuration.
    pub fn stats(&self) -> CircuitStats {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            opened_at: inner.opened_at_utc,
            half_open_calls: inner.half_open_calls,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_seconds: self.config.reset_timeout.as_secs_f64(),
            half_open_max_calls: self.config.half_open_max_calls,
        }
    }

    /// Force the breaker closed and clear the trip bookkeeping.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.opened_at_utc = None;
        inner.half_open_calls = 0;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Scoped form: admit a call and return a guard that settles its outcome.
    ///
    /// Dropping the guard without calling [`BreakerGuard::success`] records a
    /// failure, which covers early returns, `?`, panics, and cancelled futures.
    pub fn enter(&self) -> Result<BreakerGuard<'_>, CircuitOpenError> {
        self.admit()?;
        Ok(BreakerGuard {
            breaker: self,
            settled: false,
        })
    }

    /// Callable form: run `operation` if admitted and record its outcome.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.enter()?;
        match operation().await {
            Ok(value) => {
                guard.success();
                Ok(value)
            }
            Err(err) => {
                guard.failure();
                Err(CallError::Failed(err))
            }
        }
    }

    fn admit(&self) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        let retry_after = match inner.state {
            CircuitState::Closed => return Ok(()),
            CircuitState::HalfOpen if inner.half_open_calls < self.config.half_open_max_calls => {
                inner.half_open_calls += 1;
                return Ok(());
            }
            CircuitState::HalfOpen => Duration::ZERO,
            CircuitState::Open => self.remaining_cooldown(&inner, now),
        };
        drop(inner);

        debug!(
            breaker = %self.name,
            retry_after_seconds = retry_after.as_secs_f64(),
            "circuit breaker rejected call"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_call(&self.name, CallOutcome::Rejected);
        }
        Err(CircuitOpenError {
            name: self.name.clone(),
            retry_after,
        })
    }

    fn record_success(&self) {
        let at = self.clock.utc_now();
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.success_count += 1;
        inner.last_success_time = Some(at);
        if inner.state == CircuitState::HalfOpen {
            inner.failure_count = 0;
            inner.half_open_calls = 0;
            self.transition(&mut inner, CircuitState::Closed);
        }
        drop(inner);
        if let Some(metrics) = &self.metrics {
            metrics.record_call(&self.name, CallOutcome::Success);
        }
    }

    fn record_failure(&self) {
        let now = self.clock.now();
        let at = self.clock.utc_now();
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(at);
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.trip(&mut inner, now, at);
            }
            CircuitState::HalfOpen => {
                inner.half_open_calls = 0;
                self.trip(&mut inner, now, at);
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
        drop(inner);
        if let Some(metrics) = &self.metrics {
            metrics.record_call(&self.name, CallOutcome::Failure);
        }
    }

    fn trip(&self, inner: &mut BreakerState, now: Instant, at: DateTime<Utc>) {
        inner.opened_at = Some(now);
        inner.opened_at_utc = Some(at);
        self.transition(inner, CircuitState::Open);
    }

    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or(self.config.reset_timeout);
        if elapsed >= self.config.reset_timeout {
            inner.half_open_calls = 0;
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn remaining_cooldown(&self, inner: &BreakerState, now: Instant) -> Duration {
        inner
            .opened_at
            .map(|opened| {
                self.config
                    .reset_timeout
                    .saturating_sub(now.saturating_duration_since(opened))
            })
            .unwrap_or(Duration::ZERO)
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        info!(
            event = "circuit_breaker_state_change",
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            failure_count = inner.failure_count,
            "circuit breaker state change"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(&self.name, from, to);
        }
    }
}

/// Admission token returned by [`CircuitBreaker::enter`].
#[must_use = "dropping an unsettled guard records a failure"]
#[derive(Debug)]
pub struct BreakerGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl BreakerGuard<'_> {
    /// Record a successful outcome.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Record a failed outcome.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}
