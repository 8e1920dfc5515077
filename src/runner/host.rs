//! Host-process container backend.
//!
//! Runs the test script through `sh -c` inside the environment's workspace
//! directory, as the leader of its own process group. A timeout kills the
//! whole group.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::environment::{Environment, HardwareProfile};
use crate::error::RunnerError;
use crate::model::{ExecutionResult, TestCase, TestType};
use crate::process::{run_process_group, ProcessRegistry, ProcessSpec};

use super::{script_env, BackendKind, Runner};

/// Lightweight container runner backed by a host process group.
pub struct HostRunner {
    env_id: String,
    workspace: PathBuf,
    processes: ProcessRegistry,
}

impl HostRunner {
    pub fn new(environment: Environment, processes: ProcessRegistry) -> Self {
        Self {
            workspace: environment.workspace_dir(),
            env_id: environment.id,
            processes,
        }
    }
}

#[async_trait]
impl Runner for HostRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(
        &self,
        test: &TestCase,
        timeout: Duration,
    ) -> Result<ExecutionResult, RunnerError> {
        tokio::fs::create_dir_all(&self.workspace).await?;

        let mut spec = ProcessSpec::shell(&test.script).with_current_dir(&self.workspace);
        for (key, value) in script_env(test, &self.env_id) {
            spec = spec.with_env(key, value);
        }

        debug!(env_id = %self.env_id, test_id = %test.id, "Running test in host process group");
        let output =
            run_process_group(&spec, timeout, Some((&self.processes, self.env_id.as_str()))).await?;

        Ok(ExecutionResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            execution_time: output.duration,
            timed_out: output.timed_out,
        })
    }

    async fn cleanup(&self) -> Result<(), RunnerError> {
        self.processes.kill(&self.env_id);
        Ok(())
    }

    fn supports_test_type(&self, test_type: TestType) -> bool {
        matches!(test_type, TestType::Unit | TestType::Integration)
    }

    fn supports_hardware(&self, profile: &HardwareProfile) -> bool {
        profile.is_virtual
    }
}
