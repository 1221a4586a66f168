//! Prometheus metrics for hlwatch

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec,
};

/// Number of accelerators enumerated
static DEVICE_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "hlwatch_device_count",
        "Number of accelerators detected"
    ))
    .expect("Failed to create device_count metric")
});

/// Per-device unhealthy flag (0=healthy, 1=unhealthy)
static DEVICE_UNHEALTHY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("hlwatch_device_unhealthy", "Accelerator marked unhealthy"),
        &["serial"]
    )
    .expect("Failed to create device_unhealthy metric")
});

/// Event wait outcomes
static WAIT_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hlwatch_wait_outcomes_total", "Outcomes of health event waits"),
        &["outcome"]
    )
    .expect("Failed to create wait_outcomes metric")
});

/// Unhealthy deliveries by reason
static UNHEALTHY_DELIVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "hlwatch_unhealthy_deliveries_total",
            "Devices delivered to the unhealthy queue"
        ),
        &["reason"]
    )
    .expect("Failed to create unhealthy_deliveries metric")
});

static REGISTRATION_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hlwatch_registration_failures_total",
        "Failed critical event registrations"
    ))
    .expect("Failed to create registration_failures metric")
});

static WAIT_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "hlwatch_wait_duration_seconds",
        "Duration of health event waits",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to create wait_duration metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*DEVICE_COUNT;
        let _ = &*DEVICE_UNHEALTHY;
        let _ = &*WAIT_OUTCOMES;
        let _ = &*UNHEALTHY_DELIVERIES;
        let _ = &*REGISTRATION_FAILURES;
        let _ = &*WAIT_DURATION;
        Self
    }

    pub fn set_device_count(&self, count: i64) {
        DEVICE_COUNT.set(count);
    }

    /// Flag a device healthy or unhealthy
    pub fn set_device_unhealthy(&self, serial: &str, unhealthy: bool) {
        DEVICE_UNHEALTHY
            .with_label_values(&[serial])
            .set(i64::from(unhealthy));
    }

    pub fn inc_wait_outcome(&self, outcome: &str) {
        WAIT_OUTCOMES.with_label_values(&[outcome]).inc();
    }

    pub fn inc_unhealthy_delivery(&self, reason: &str) {
        UNHEALTHY_DELIVERIES.with_label_values(&[reason]).inc();
    }

    pub fn inc_registration_failure(&self) {
        REGISTRATION_FAILURES.inc();
    }

    pub fn observe_wait_duration(&self, duration_secs: f64) {
        WAIT_DURATION.observe(duration_secs);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();

        registry.set_device_count(8);
        registry.set_device_unhealthy("FK00000001", true);
        registry.inc_wait_outcome("timeout");
        registry.inc_unhealthy_delivery("critical_error");
        registry.inc_registration_failure();
        registry.observe_wait_duration(0.02);

        assert_eq!(DEVICE_COUNT.get(), 8);
        assert_eq!(
            DEVICE_UNHEALTHY.with_label_values(&["FK00000001"]).get(),
            1
        );
        assert!(
            prometheus::gather()
                .iter()
                .any(|family| family.get_name() == "hlwatch_wait_duration_seconds")
        );
    }
}
