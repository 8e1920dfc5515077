//! Execution plans and progress tracking.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{TestCase, TestResult};

/// Lifecycle of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Returns true once the plan can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlanStatus::Queued => "queued",
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Plan priority, carried as metadata and used to order active plans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" | "medium" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" | "urgent" => Ok(Priority::Critical),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Request to start an execution plan.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub plan_id: String,
    pub tests: Vec<TestCase>,
    pub created_by: String,
    pub priority: Priority,
    /// Per-test timeout; the service default applies when unset.
    pub timeout: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
}

impl PlanRequest {
    pub fn new(plan_id: impl Into<String>, tests: Vec<TestCase>) -> Self {
        Self {
            plan_id: plan_id.into(),
            tests,
            created_by: "unknown".to_string(),
            priority: Priority::default(),
            timeout: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An accepted batch of tests.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub tests: Vec<TestCase>,
    pub priority: Priority,
    pub status: PlanStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Per-test timeout in effect.
    pub timeout: Duration,
    pub metadata: BTreeMap<String, String>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Cause of a FAILED plan.
    pub error: Option<String>,
}

impl ExecutionPlan {
    pub(crate) fn from_request(request: PlanRequest, timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            plan_id: request.plan_id,
            tests: request.tests,
            priority: request.priority,
            status: PlanStatus::Queued,
            created_by: request.created_by,
            created_at: now,
            timeout,
            metadata: request.metadata,
            finished_at: None,
            error: None,
        }
    }
}

/// Live counters of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionProgress {
    pub plan_id: String,
    pub total: usize,
    /// Tests finished, whatever their status.
    pub completed: usize,
    /// Finished tests with a failing status.
    pub failed: usize,
    pub running: usize,
    pub percentage: f64,
    pub current_test: Option<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Moving average of observed per-test wall time.
    pub average_test_seconds: f64,
}

impl ExecutionProgress {
    /// Fresh progress; completion is estimated from the timeout until a
    /// test has been observed.
    pub(crate) fn new(plan_id: &str, total: usize, timeout: Duration, now: DateTime<Utc>) -> Self {
        let average = timeout.as_secs_f64();
        Self {
            plan_id: plan_id.to_string(),
            total,
            completed: 0,
            failed: 0,
            running: 0,
            percentage: if total == 0 { 100.0 } else { 0.0 },
            current_test: None,
            estimated_completion: Some(estimate(now, total, average)),
            average_test_seconds: average,
        }
    }

    pub(crate) fn test_started(&mut self, test_name: &str) {
        self.running = 1;
        self.current_test = Some(test_name.to_string());
    }

    /// Folds one finished test into the counters.
    pub(crate) fn test_finished(&mut self, result: &TestResult, now: DateTime<Utc>) {
        self.running = 0;
        self.current_test = None;
        self.completed += 1;
        if result.status().is_failure() {
            self.failed += 1;
        }

        let observed = result.execution_time.as_secs_f64();
        let n = self.completed as f64;
        self.average_test_seconds = if self.completed == 1 {
            observed
        } else {
            self.average_test_seconds + (observed - self.average_test_seconds) / n
        };

        self.percentage = if self.total == 0 {
            100.0
        } else {
            (self.completed as f64 / self.total as f64 * 100.0).min(100.0)
        };
        let remaining = self.total.saturating_sub(self.completed);
        self.estimated_completion = Some(estimate(now, remaining, self.average_test_seconds));
    }

    /// Clears the estimate of a plan that stopped.
    pub(crate) fn stopped(&mut self) {
        self.running = 0;
        self.current_test = None;
        self.estimated_completion = None;
    }
}

fn estimate(now: DateTime<Utc>, remaining: usize, average_secs: f64) -> DateTime<Utc> {
    let millis = (remaining as f64 * average_secs * 1000.0).min(i64::MAX as f64 / 2.0) as i64;
    now + chrono::Duration::milliseconds(millis)
}

/// Read-only view of a plan, its progress and its results so far.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSnapshot {
    pub plan: ExecutionPlan,
    pub progress: ExecutionProgress,
    pub results: Vec<TestResult>,
}
