//! ---
//! ops_section: "07-resilience-fault-tolerance"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Circuit breaking, retry, and fail-closed gating."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsflow_common::config::RetrySettings;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::error::{CallError, CircuitOpenError};
use crate::metrics::ResilienceMetrics;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries + 1` invocations at most.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay, applied before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Multiply each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy without jitter.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter: false,
        }
    }

    /// Override the growth factor.
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Toggle jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic delay before retry `attempt` (0-indexed), capped at `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.exponential_base.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Delay before retry `attempt`, with jitter applied when enabled.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter {
            delay.mul_f64(rng.gen_range(0.5..=1.5))
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            exponential_base: settings.exponential_base,
            jitter: settings.jitter,
        }
    }
}

/// Suspension point used between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `delay`.
    async fn sleep(&self, delay: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Test sleeper that records every requested delay and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    /// Fresh recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().push(delay);
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
#[derive(Debug)]
pub struct Retrier<S = TokioSleeper> {
    policy: RetryPolicy,
    sleeper: S,
    rng: Mutex<StdRng>,
    operation: String,
    metrics: Option<ResilienceMetrics>,
}

impl Retrier<TokioSleeper> {
    /// Retrier sleeping on the tokio timer.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, TokioSleeper)
    }
}

impl<S: Sleeper> Retrier<S> {
    /// Retrier using a custom sleeper.
    pub fn with_sleeper(policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            policy,
            sleeper,
            rng: Mutex::new(StdRng::from_entropy()),
            operation: "operation".to_owned(),
            metrics: None,
        }
    }

    /// Seed the jitter RNG for reproducible delays.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Label used in logs and metrics.
    pub fn named(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Attach metric handles.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `op` until it succeeds, a non-retryable error occurs, or retries run out.
    ///
    /// `op` receives the 1-based attempt number. After exhaustion the last error is
    /// returned unchanged.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt: u32 = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !retryable(&err) {
                return Err(err);
            }
            if attempt > self.policy.max_retries {
                warn!(
                    event = "retry_exhausted",
                    operation = %self.operation,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_exhausted(&self.operation);
                }
                return Err(err);
            }

            let delay = {
                let mut rng = self.rng.lock();
                self.policy.delay_for(attempt - 1, &mut *rng)
            };
            info!(
                event = "retry_attempt",
                operation = %self.operation,
                attempt,
                delay_seconds = delay.as_secs_f64(),
                error = %err,
                "retrying after failure"
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_retry(&self.operation);
            }
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Retry with the tokio timer, for call sites without a long-lived [`Retrier`].
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: RetryPolicy,
    retryable: P,
    op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    Retrier::new(policy).run(op, retryable).await
}

/// Predicate retrying every error.
pub fn retry_all<E>(_: &E) -> bool {
    true
}

/// Predicate retrying `anyhow` errors whose cause chain contains a `T`.
pub fn retry_on<T>() -> impl Fn(&anyhow::Error) -> bool
where
    T: std::error::Error + Send + Sync + 'static,
{
    |err: &anyhow::Error| err.chain().any(|cause| cause.is::<T>())
}

/// Predicate refusing to retry breaker rejections.
///
/// Works for both `CallError<E>` and `anyhow::Error` values.
pub fn not_circuit_open<E: IsCircuitOpen>(err: &E) -> bool {
    !err.is_circuit_open()
}

/// Errors that can carry a breaker rejection.
pub trait IsCircuitOpen {
    /// Whether this error is a breaker rejection.
    fn is_circuit_open(&self) -> bool;
}

impl<E> IsCircuitOpen for CallError<E> {
    fn is_circuit_open(&self) -> bool {
        self.is_open()
    }
}

impl IsCircuitOpen for anyhow::Error {
    fn is_circuit_open(&self) -> bool {
        self.chain().any(|cause| cause.is::<CircuitOpenError>())
    }
}

impl IsCircuitOpen for CircuitOpenError {
    fn is_circuit_open(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct ConnectionReset;

    #[derive(Debug, thiserror::Error)]
    #[error("bad request")]
    struct BadRequest;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_secs(*v)).collect()
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_two_delays() {
        let sleeper = RecordingSleeper::new();
        let retrier = Retrier::with_sleeper(
            RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60)),
            sleeper.clone(),
        );
        let calls = AtomicU32::new(0);
        let result = retrier
            .run(
                |_| async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(anyhow::Error::new(ConnectionReset))
                    } else {
                        Ok("ok")
                    }
                },
                retry_on::<ConnectionReset>(),
            )
            .await;
        assert_eq!(result.expect("third attempt succeeds"), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays(), secs(&[1, 2]));
    }

    #[tokio::test]
    async fn delays_are_capped_at_max_delay() {
        let sleeper = RecordingSleeper::new();
        let retrier = Retrier::with_sleeper(
            RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(25)),
            sleeper.clone(),
        );
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retrier
            .run(
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("still down")
                },
                retry_all,
            )
            .await;
        assert_eq!(result, Err("still down"));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(sleeper.delays(), secs(&[10, 20, 25, 25, 25]));
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_without_sleeping() {
        let sleeper = RecordingSleeper::new();
        let retrier = Retrier::with_sleeper(RetryPolicy::default(), sleeper.clone());
        let calls = AtomicU32::new(0);
        let result: Result<(), anyhow::Error> = retrier
            .run(
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::Error::new(BadRequest))
                },
                retry_on::<ConnectionReset>(),
            )
            .await;
        assert!(result.expect_err("fails").is::<BadRequest>());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn always_failing_call_sleeps_one_then_two_seconds_and_returns_last_error() {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(60))
            .with_exponential_base(2.0)
            .with_jitter(false);
        let retrier = Retrier::with_sleeper(policy, sleeper.clone());
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retrier
            .run(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(format!("attempt {attempt}")) }
                },
                retry_all,
            )
            .await;
        assert_eq!(result, Err("attempt 3".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays(), secs(&[1, 2]));
    }

    #[test]
    fn jitter_stays_within_half_and_one_and_a_half() {
        let policy = RetryPolicy::new(10, Duration::from_secs(4), Duration::from_secs(60))
            .with_jitter(true);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..5 {
            let base = policy.base_delay_for(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for(attempt, &mut rng);
                assert!(delay >= base.mul_f64(0.5));
                assert!(delay <= base.mul_f64(1.5));
            }
        }
    }

    #[test]
    fn seeded_retriers_produce_identical_jitter() {
        let policy = RetryPolicy::default();
        let a = Retrier::with_sleeper(policy, RecordingSleeper::new()).with_seed(42);
        let b = Retrier::with_sleeper(policy, RecordingSleeper::new()).with_seed(42);
        let first = policy.delay_for(1, &mut *a.rng.lock());
        let second = policy.delay_for(1, &mut *b.rng.lock());
        assert_eq!(first, second);
    }

    #[test]
    fn policy_follows_settings() {
        let settings = RetrySettings::default();
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!(policy.jitter);
    }

    #[test]
    fn circuit_open_predicate_matches_wrapped_rejections() {
        let rejection = CircuitOpenError {
            name: "opa".into(),
            retry_after: Duration::from_secs(1),
        };
        let wrapped = anyhow::Error::new(rejection.clone()).context("policy lookup");
        assert!(!not_circuit_open(&wrapped));
        assert!(!not_circuit_open(&CallError::<BadRequest>::Open(rejection)));
        assert!(not_circuit_open(&anyhow::Error::new(BadRequest)));
    }
}
