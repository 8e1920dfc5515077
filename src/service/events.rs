//! Plan notifications.

use serde::Serialize;

use crate::model::TestStatus;

use super::plan::{ExecutionProgress, PlanStatus};

/// Capacity of the event channel; slow subscribers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event published while plans run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanStarted {
        plan_id: String,
        total: usize,
    },
    TestStarted {
        plan_id: String,
        test_id: String,
        env_id: String,
    },
    TestCompleted {
        plan_id: String,
        test_id: String,
        status: TestStatus,
        progress: ExecutionProgress,
    },
    PlanFinished {
        plan_id: String,
        status: PlanStatus,
        error: Option<String>,
    },
}

impl PlanEvent {
    pub fn plan_id(&self) -> &str {
        match self {
            PlanEvent::PlanStarted { plan_id, .. }
            | PlanEvent::TestStarted { plan_id, .. }
            | PlanEvent::TestCompleted { plan_id, .. }
            | PlanEvent::PlanFinished { plan_id, .. } => plan_id,
        }
    }
}
