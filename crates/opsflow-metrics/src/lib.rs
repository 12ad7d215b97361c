//! ---
//! ops_section: "03-observability"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Metrics collection and export utilities."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Registry, TextEncoder};
use tracing::debug;

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in the registry using the Prometheus text exposition format.
pub fn render_text(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    debug!(families = families.len(), "rendering metrics");
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Read the current value of a counter family for the given label set.
///
/// Returns `None` when the family or the label combination has not been recorded yet.
pub fn counter_value(registry: &Registry, family: &str, labels: &[(&str, &str)]) -> Option<f64> {
    registry
        .gather()
        .iter()
        .find(|fam| fam.get_name() == family)?
        .get_metric()
        .iter()
        .find(|metric| {
            labels.iter().all(|(name, value)| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == *name && label.get_value() == *value)
            })
        })
        .map(|metric| metric.get_counter().get_value())
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounterVec, Opts};

    #[test]
    fn counters_render_and_can_be_read_back() {
        let registry = new_registry();
        let counter = IntCounterVec::new(
            Opts::new("opsflow_test_total", "Test counter"),
            &["kind"],
        )
        .expect("counter");
        registry
            .register(Box::new(counter.clone()))
            .expect("register");
        counter.with_label_values(&["a"]).inc_by(3);

        let text = render_text(&registry).expect("render");
        assert!(text.contains("opsflow_test_total"));
        assert_eq!(
            counter_value(&registry, "opsflow_test_total", &[("kind", "a")]),
            Some(3.0)
        );
        assert_eq!(
            counter_value(&registry, "opsflow_test_total", &[("kind", "b")]),
            None
        );
    }
}
