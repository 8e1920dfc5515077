//! Result aggregation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{TestResult, TestStatus};

/// Dimension results are grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    None,
    Architecture,
    BoardType,
    PeripheralConfig,
}

impl GroupBy {
    /// Group key of `result` for this dimension.
    fn key(&self, result: &TestResult) -> Option<String> {
        match self {
            GroupBy::None => None,
            GroupBy::Architecture => Some(result.environment.architecture.clone()),
            GroupBy::BoardType => Some(result.environment.board_type.clone()),
            GroupBy::PeripheralConfig => Some(result.environment.peripheral_config.clone()),
        }
    }
}

impl std::fmt::Display for GroupBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GroupBy::None => "none",
            GroupBy::Architecture => "architecture",
            GroupBy::BoardType => "board_type",
            GroupBy::PeripheralConfig => "peripheral_config",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(GroupBy::None),
            "architecture" | "arch" => Ok(GroupBy::Architecture),
            "board_type" | "board" => Ok(GroupBy::BoardType),
            "peripheral_config" | "peripherals" => Ok(GroupBy::PeripheralConfig),
            _ => Err(format!("Unknown grouping: {s}")),
        }
    }
}

/// Counts over a set of results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultStats {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
    pub skipped: usize,
    /// Passed over total, 0.0 for an empty set.
    pub pass_rate: f64,
    /// Sum of execution times.
    pub total_execution_time: Duration,
}

impl ResultStats {
    fn add(&mut self, result: &TestResult) {
        self.total += 1;
        match result.status() {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Timeout => self.timeout += 1,
            TestStatus::Error => self.error += 1,
            TestStatus::Skipped => self.skipped += 1,
        }
        self.total_execution_time += result.execution_time;
    }

    fn finish(&mut self) {
        self.pass_rate = if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        };
    }
}

/// Overall statistics plus one entry per observed group value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateReport {
    pub group_by: GroupBy,
    pub overall: ResultStats,
    /// Empty when `group_by` is `None`.
    pub groups: BTreeMap<String, ResultStats>,
}

/// Aggregates `results`, optionally grouped along one dimension.
///
/// Only values present in `results` produce groups, so the group totals
/// always sum to the overall total.
pub fn aggregate(results: &[TestResult], group_by: GroupBy) -> AggregateReport {
    let mut overall = ResultStats::default();
    let mut groups: BTreeMap<String, ResultStats> = BTreeMap::new();

    for result in results {
        overall.add(result);
        if let Some(key) = group_by.key(result) {
            groups.entry(key).or_default().add(result);
        }
    }

    overall.finish();
    groups.values_mut().for_each(ResultStats::finish);

    AggregateReport {
        group_by,
        overall,
        groups,
    }
}
