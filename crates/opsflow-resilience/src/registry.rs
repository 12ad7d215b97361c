//! ---
//! ops_section: "07-resilience-fault-tolerance"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Circuit breaking, retry, and fail-closed gating."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use opsflow_common::config::BreakerSettings;
use opsflow_common::time::{SharedClock, SystemClock};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
use crate::error::ResilienceError;
use crate::metrics::ResilienceMetrics;

static GLOBAL: Lazy<CircuitBreakerRegistry> = Lazy::new(CircuitBreakerRegistry::new);

/// Named collection of breakers, one per protected dependency.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    clock: SharedClock,
    metrics: Option<ResilienceMetrics>,
    breakers: RwLock<IndexMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Empty registry using the system clock.
    pub fn new() -> Self {
        Self {
            clock: SystemClock::shared(),
            metrics: None,
            breakers: RwLock::new(IndexMap::new()),
        }
    }

    /// Process-wide registry for call sites that are not handed one explicitly.
    pub fn global() -> &'static CircuitBreakerRegistry {
        &GLOBAL
    }

    /// Build a registry and pre-register every breaker named in the overrides table.
    pub fn from_settings(settings: &BreakerSettings) -> Result<Self, ResilienceError> {
        let registry = Self::new();
        registry.register_from_settings(settings)?;
        Ok(registry)
    }

    /// Clock handed to breakers created after this call.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Metrics handed to breakers created after this call.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register every override declared in `settings`.
    pub fn register_from_settings(
        &self,
        settings: &BreakerSettings,
    ) -> Result<(), ResilienceError> {
        settings
            .validate()
            .map_err(|err| ResilienceError::InvalidConfig(format!("{err:#}")))?;
        for name in settings.overrides.keys() {
            self.register(name.clone(), settings.profile_for(name).into());
        }
        Ok(())
    }

    /// Return the breaker registered under `name`, creating it on first use.
    ///
    /// A later registration with a different configuration keeps the original breaker.
    pub fn register(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let name = name.into();
        if let Some(existing) = self.breakers.read().get(&name) {
            if existing.config() != &config {
                debug!(breaker = %name, "breaker already registered; ignoring new configuration");
            }
            return existing.clone();
        }

        let mut breakers = self.breakers.write();
        if let Some(existing) = breakers.get(&name) {
            return existing.clone();
        }
        let mut breaker = CircuitBreaker::new(name.clone(), config).with_clock(self.clock.clone());
        if let Some(metrics) = &self.metrics {
            breaker = breaker.with_metrics(metrics.clone());
        }
        let breaker = Arc::new(breaker);
        breakers.insert(name.clone(), breaker.clone());
        info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_seconds = config.reset_timeout.as_secs_f64(),
            half_open_max_calls = config.half_open_max_calls,
            "circuit breaker registered"
        );
        breaker
    }

    /// Look up a breaker without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }

    /// Snapshot every breaker.
    pub fn all_stats(&self) -> IndexMap<String, CircuitStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }

    /// Force a single breaker closed.
    pub fn reset(&self, name: &str) -> Result<(), ResilienceError> {
        let breaker = self
            .get(name)
            .ok_or_else(|| ResilienceError::UnknownBreaker(name.to_owned()))?;
        breaker.reset();
        Ok(())
    }

    /// Force every breaker closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether nothing has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use opsflow_common::config::BreakerOverride;
    use std::time::Duration;

    #[test]
    fn register_is_idempotent_by_name() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.register("opa", CircuitBreakerConfig::new(1, Duration::from_secs(5)));
        let second =
            registry.register("opa", CircuitBreakerConfig::new(9, Duration::from_secs(60)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn stats_and_reset_cover_every_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let db = registry.register("db", CircuitBreakerConfig::new(1, Duration::from_secs(30)));
        registry.register("cache", CircuitBreakerConfig::default());

        let _ = db.call(|| async { Err::<(), _>("down") }).await;
        let stats = registry.all_stats();
        assert_eq!(stats.keys().cloned().collect::<Vec<_>>(), registry.names());
        assert_eq!(stats["db"].state, CircuitState::Open);
        assert_eq!(stats["cache"].state, CircuitState::Closed);

        registry.reset("db").expect("known breaker");
        assert_eq!(db.state(), CircuitState::Closed);
        assert_eq!(
            registry.reset("missing"),
            Err(ResilienceError::UnknownBreaker("missing".into()))
        );

        let _ = db.call(|| async { Err::<(), _>("down") }).await;
        registry.reset_all();
        assert_eq!(db.state(), CircuitState::Closed);
    }

    #[test]
    fn settings_pre_register_overrides() {
        let mut settings = BreakerSettings::default();
        settings.overrides.insert(
            "opa".into(),
            BreakerOverride {
                failure_threshold: Some(2),
                reset_timeout: Some(Duration::from_secs(10)),
                half_open_max_calls: None,
            },
        );
        let registry = CircuitBreakerRegistry::from_settings(&settings).expect("valid settings");
        let opa = registry.get("opa").expect("pre-registered");
        assert_eq!(opa.config().failure_threshold, 2);
        assert_eq!(opa.config().reset_timeout, Duration::from_secs(10));
        assert_eq!(opa.config().half_open_max_calls, 1);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = BreakerSettings::default();
        settings.defaults.failure_threshold = 0;
        let err = CircuitBreakerRegistry::from_settings(&settings).expect_err("invalid");
        assert!(matches!(err, ResilienceError::InvalidConfig(_)));
    }

    #[test]
    fn global_registry_is_shared() {
        let a = CircuitBreakerRegistry::global()
            .register("global-test", CircuitBreakerConfig::default());
        let b = CircuitBreakerRegistry::global().get("global-test").expect("registered");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
