//! Resource tracking and idle reclamation.
//!
//! The [`ResourceManager`] keeps a power/usage record per environment,
//! finds resources idle beyond a threshold and reclaims them through the
//! [`EnvironmentManager`](crate::environment::EnvironmentManager). A
//! [`ReclaimerHandle`] runs that reclamation periodically in the background.

pub mod manager;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use manager::{ReclaimerHandle, ResourceManager};

/// Power state of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

/// Activity of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Idle,
    Busy,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Idle => write!(f, "idle"),
            ResourceStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Accumulated usage of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageMetrics {
    pub tests_completed: u64,
    /// Seconds spent busy, excluding the current busy span.
    pub busy_seconds: f64,
    pub last_test_at: Option<DateTime<Utc>>,
}

/// Tracked state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceState {
    pub resource_id: String,
    pub power_state: PowerState,
    pub status: ResourceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Start of the current busy span.
    pub busy_since: Option<DateTime<Utc>>,
    pub usage: UsageMetrics,
    /// Cost accrued while powered on, filled in on snapshots.
    pub cost_estimate: f64,
}

impl ResourceState {
    pub(crate) fn new(resource_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            resource_id: resource_id.into(),
            power_state: PowerState::On,
            status: ResourceStatus::Idle,
            registered_at: now,
            last_active: now,
            busy_since: None,
            usage: UsageMetrics::default(),
            cost_estimate: 0.0,
        }
    }

    /// Seconds since the resource was last active.
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.last_active, now)
    }

    /// Fraction of its lifetime the resource spent busy, in `[0, 1]`.
    pub fn utilization(&self, now: DateTime<Utc>) -> f64 {
        let lifetime = seconds_between(self.registered_at, now);
        if lifetime <= 0.0 {
            return 0.0;
        }
        let current = self
            .busy_since
            .map(|since| seconds_between(since, now))
            .unwrap_or(0.0);
        ((self.usage.busy_seconds + current) / lifetime).clamp(0.0, 1.0)
    }
}

/// Aggregate view over all tracked resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UtilizationSummary {
    pub total_resources: usize,
    pub powered_on: usize,
    pub busy: usize,
    pub idle: usize,
    pub tests_completed: u64,
    /// Mean utilization across resources, 0.0 when none are tracked.
    pub average_utilization: f64,
    pub total_cost_estimate: f64,
}

pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}
