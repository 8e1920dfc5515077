//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by kernel-forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all kernel-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of tests executed, labeled by status and backend.
pub static TESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Test execution duration in seconds, labeled by backend.
pub static TEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of environments currently registered.
pub static ENVIRONMENTS_ACTIVE: OnceLock<Gauge> = OnceLock::new();

/// Total environments reclaimed for idleness.
pub static RESOURCES_RECLAIMED: OnceLock<Counter> = OnceLock::new();

/// Number of execution plans currently running.
pub static PLANS_ACTIVE: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Should be called once at startup. Later calls are harmless: the first
/// set of metrics stays installed.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due
/// to duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tests_total = CounterVec::new(
        Opts::new("kforge_tests_total", "Total number of tests executed"),
        &["status", "backend"],
    )?;

    let test_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "kforge_test_duration_seconds",
            "Test execution duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["backend"],
    )?;

    let environments_active = Gauge::new(
        "kforge_environments_active",
        "Number of environments currently registered",
    )?;

    let resources_reclaimed = Counter::new(
        "kforge_resources_reclaimed_total",
        "Total environments reclaimed for idleness",
    )?;

    let plans_active = Gauge::new("kforge_plans_active", "Number of running execution plans")?;

    registry.register(Box::new(tests_total.clone()))?;
    registry.register(Box::new(test_duration.clone()))?;
    registry.register(Box::new(environments_active.clone()))?;
    registry.register(Box::new(resources_reclaimed.clone()))?;
    registry.register(Box::new(plans_active.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TESTS_TOTAL.set(tests_total);
    let _ = TEST_DURATION.set(test_duration);
    let _ = ENVIRONMENTS_ACTIVE.set(environments_active);
    let _ = RESOURCES_RECLAIMED.set(resources_reclaimed);
    let _ = PLANS_ACTIVE.set(plans_active);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
