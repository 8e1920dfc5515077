//! Metric collectors for orchestration events.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics and gives the engine,
//! resource manager and service one place to record what happened. Recording
//! is a no-op until [`init_metrics`](super::init_metrics) has run.

use super::prometheus::{
    ENVIRONMENTS_ACTIVE, PLANS_ACTIVE, RESOURCES_RECLAIMED, TESTS_TOTAL, TEST_DURATION,
};

/// Metrics collector for recording kernel-forge operational metrics.
///
/// # Example
///
/// ```ignore
/// use kernel_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_test("passed", "container", 1.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished test.
    ///
    /// # Arguments
    ///
    /// * `status` - Final test status (e.g., "passed", "timeout")
    /// * `backend` - Backend that ran the test, or "none"
    /// * `duration_secs` - Wall-clock execution time in seconds
    pub fn record_test(&self, status: &str, backend: &str, duration_secs: f64) {
        if let Some(tests_total) = TESTS_TOTAL.get() {
            tests_total.with_label_values(&[status, backend]).inc();
        }

        if let Some(test_duration) = TEST_DURATION.get() {
            test_duration
                .with_label_values(&[backend])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            backend = backend,
            duration_secs = duration_secs,
            "Recorded test metric"
        );
    }

    /// Update the number of registered environments.
    pub fn update_environments(&self, count: usize) {
        if let Some(active) = ENVIRONMENTS_ACTIVE.get() {
            active.set(count as f64);
        }
    }

    /// Record environments reclaimed by an idle sweep.
    pub fn record_reclaimed(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(reclaimed) = RESOURCES_RECLAIMED.get() {
            reclaimed.inc_by(count as f64);
        }

        tracing::trace!(count = count, "Recorded reclaimed resources metric");
    }

    /// Increment the count of running plans by 1.
    pub fn inc_plans_active(&self) {
        if let Some(plans) = PLANS_ACTIVE.get() {
            plans.inc();
        }
    }

    /// Decrement the count of running plans by 1.
    pub fn dec_plans_active(&self) {
        if let Some(plans) = PLANS_ACTIVE.get() {
            plans.dec();
        }
    }
}
