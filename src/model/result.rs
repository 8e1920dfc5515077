//! Execution results and artifacts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runner::BackendKind;

use super::test_case::TestCase;

/// Maximum bytes of stdout/stderr kept on a result.
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Final status of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Timeout,
    Error,
    Skipped,
}

impl TestStatus {
    /// Returns true for statuses that must carry failure information.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TestStatus::Failed | TestStatus::Timeout | TestStatus::Error
        )
    }

    /// Returns the lowercase name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Timeout => "timeout",
            TestStatus::Error => "error",
            TestStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostics attached to every failed, timed-out or errored result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Human-readable description of the failure.
    pub error_message: String,
    /// Process exit code, when the process exited on its own.
    pub exit_code: Option<i32>,
    /// A crash signature was found in the captured output.
    pub kernel_panic: bool,
    /// The test was killed for exceeding its timeout.
    pub timeout_occurred: bool,
    /// Excerpt of the output around the crash signature.
    #[serde(default)]
    pub stack_trace: Option<String>,
}

impl FailureInfo {
    /// Failure for a non-zero exit without a crash signature.
    pub fn exit(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            error_message: message.into(),
            exit_code,
            kernel_panic: false,
            timeout_occurred: false,
            stack_trace: None,
        }
    }

    /// Failure caused by a crash signature.
    pub fn crash(message: impl Into<String>, exit_code: Option<i32>, excerpt: String) -> Self {
        Self {
            error_message: message.into(),
            exit_code,
            kernel_panic: true,
            timeout_occurred: false,
            stack_trace: Some(excerpt),
        }
    }

    /// Failure caused by the timeout firing.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            error_message: format!("Test timed out after {}s", timeout.as_secs_f64()),
            exit_code: None,
            kernel_panic: false,
            timeout_occurred: true,
            stack_trace: None,
        }
    }

    /// Failure inside the orchestrator rather than the test.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::exit(message, None)
    }
}

/// Classified outcome of a run.
///
/// Failure variants carry their [`FailureInfo`] so a result can never be
/// built with a failing status and no diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    Passed,
    Failed(FailureInfo),
    Timeout(FailureInfo),
    Error(FailureInfo),
    Skipped,
}

impl TestOutcome {
    /// Splits the outcome into a status and its optional failure info.
    pub fn into_parts(self) -> (TestStatus, Option<FailureInfo>) {
        match self {
            TestOutcome::Passed => (TestStatus::Passed, None),
            TestOutcome::Failed(info) => (TestStatus::Failed, Some(info)),
            TestOutcome::Timeout(info) => (TestStatus::Timeout, Some(info)),
            TestOutcome::Error(info) => (TestStatus::Error, Some(info)),
            TestOutcome::Skipped => (TestStatus::Skipped, None),
        }
    }
}

/// Diagnostic files collected from an environment after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub logs: Vec<PathBuf>,
    pub core_dumps: Vec<PathBuf>,
    pub traces: Vec<PathBuf>,
    pub metadata: BTreeMap<String, String>,
}

impl ArtifactBundle {
    /// Total number of collected files.
    pub fn file_count(&self) -> usize {
        self.logs.len() + self.core_dumps.len() + self.traces.len()
    }

    /// Returns true when nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }
}

/// Snapshot of the environment a result ran on.
///
/// Kept on the result so grouping still works after the environment has
/// been reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub id: String,
    pub architecture: String,
    pub board_type: String,
    pub peripheral_config: String,
}

impl EnvironmentRef {
    /// Reference for an environment that could not be resolved.
    pub fn unknown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            architecture: "unknown".to_string(),
            board_type: "unknown".to_string(),
            peripheral_config: "none".to_string(),
        }
    }
}

/// Raw output of a backend run, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code, or `None` when killed by a signal or timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration of the run.
    pub execution_time: Duration,
    /// The backend killed the run because the timeout elapsed.
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Combined stdout and stderr, used for crash detection.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Classified result of running one test on one environment.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub test_id: String,
    pub test_name: String,
    status: TestStatus,
    /// Wall-clock time spent executing the test.
    pub execution_time: Duration,
    pub environment: EnvironmentRef,
    /// Backend that executed the test, if one was created.
    pub backend: Option<BackendKind>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: ArtifactBundle,
    failure_info: Option<FailureInfo>,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    /// Builds a result from a classified outcome.
    pub fn new(test: &TestCase, environment: EnvironmentRef, outcome: TestOutcome) -> Self {
        let (status, failure_info) = outcome.into_parts();
        Self {
            test_id: test.id.clone(),
            test_name: test.name.clone(),
            status,
            execution_time: Duration::ZERO,
            environment,
            backend: None,
            exit_code: failure_info.as_ref().and_then(|f| f.exit_code),
            stdout: String::new(),
            stderr: String::new(),
            artifacts: ArtifactBundle::default(),
            failure_info,
            timestamp: Utc::now(),
        }
    }

    /// Builds an ERROR result for a test that never reached a backend.
    pub fn error(test: &TestCase, environment: EnvironmentRef, message: impl Into<String>) -> Self {
        Self::new(
            test,
            environment,
            TestOutcome::Error(FailureInfo::internal(message)),
        )
    }

    /// Attaches raw execution output, truncating long streams.
    pub fn with_execution(mut self, execution: &ExecutionResult) -> Self {
        self.exit_code = execution.exit_code;
        self.stdout = truncate_output(&execution.stdout, MAX_CAPTURED_OUTPUT);
        self.stderr = truncate_output(&execution.stderr, MAX_CAPTURED_OUTPUT);
        self
    }

    /// Sets the measured execution time.
    pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time = elapsed;
        self
    }

    /// Sets the backend that ran the test.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Attaches collected artifacts.
    pub fn with_artifacts(mut self, artifacts: ArtifactBundle) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn failure_info(&self) -> Option<&FailureInfo> {
        self.failure_info.as_ref()
    }

    pub fn is_passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

/// Truncates `s` to at most `max` bytes on a char boundary.
pub(crate) fn truncate_output(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}
