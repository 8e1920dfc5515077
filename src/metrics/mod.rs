//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks test executions per backend, registered environments, idle
//! reclamation and running plans.
//!
//! # Example
//!
//! ```ignore
//! use kernel_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_test("passed", "container", 2.0);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ENVIRONMENTS_ACTIVE, PLANS_ACTIVE, REGISTRY, RESOURCES_RECLAIMED, TESTS_TOTAL, TEST_DURATION,
};
