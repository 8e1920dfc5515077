//! Physical lab backend.
//!
//! Hands the test script to an operator-configured lab command (for example
//! a wrapper around a board farm client). The command receives the script in
//! `KFORGE_SCRIPT` and the target board in `KFORGE_BOARD`; its exit status
//! and output are taken as the test's.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::environment::{Environment, HardwareProfile};
use crate::error::RunnerError;
use crate::model::{ExecutionResult, TestCase, TestType};
use crate::process::{run_process_group, ProcessRegistry, ProcessSpec};

use super::{script_env, BackendKind, Runner};

/// Runs tests on lab hardware through an external command.
pub struct PhysicalRunner {
    command: String,
    environment: Environment,
    processes: ProcessRegistry,
}

impl PhysicalRunner {
    pub fn new(command: impl Into<String>, environment: Environment, processes: ProcessRegistry) -> Self {
        Self {
            command: command.into(),
            environment,
            processes,
        }
    }

    fn build_spec(&self, test: &TestCase) -> ProcessSpec {
        let hw = &self.environment.hardware;
        let mut spec = ProcessSpec::shell(&self.command)
            .with_current_dir(self.environment.workspace_dir())
            .with_env("KFORGE_SCRIPT", &test.script)
            .with_env("KFORGE_BOARD", hw.board_label())
            .with_env("KFORGE_ARCH", &hw.architecture);
        for (key, value) in script_env(test, &self.environment.id) {
            spec = spec.with_env(key, value);
        }
        spec
    }
}

#[async_trait]
impl Runner for PhysicalRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Physical
    }

    async fn execute(
        &self,
        test: &TestCase,
        timeout: Duration,
    ) -> Result<ExecutionResult, RunnerError> {
        tokio::fs::create_dir_all(self.environment.workspace_dir()).await?;
        let spec = self.build_spec(test);

        debug!(
            env_id = %self.environment.id,
            test_id = %test.id,
            board = %self.environment.hardware.board_label(),
            "Dispatching test to lab hardware"
        );
        let output = run_process_group(
            &spec,
            timeout,
            Some((&self.processes, self.environment.id.as_str())),
        )
        .await?;

        Ok(ExecutionResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            execution_time: output.duration,
            timed_out: output.timed_out,
        })
    }

    async fn cleanup(&self) -> Result<(), RunnerError> {
        self.processes.kill(&self.environment.id);
        Ok(())
    }

    fn supports_test_type(&self, _test_type: TestType) -> bool {
        true
    }

    fn supports_hardware(&self, profile: &HardwareProfile) -> bool {
        !profile.is_virtual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn board_env(dir: &TempDir) -> Environment {
        Environment {
            id: "env-board".to_string(),
            hardware: HardwareProfile::physical("aarch64", "rpi4"),
            status: EnvironmentStatus::Busy,
            created_at: Utc::now(),
            last_used: Utc::now(),
            kernel_version: None,
            storage_dir: dir.path().to_path_buf(),
            disk_image: None,
            kernel_image: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_build_spec_env() {
        let dir = TempDir::new().unwrap();
        let runner = PhysicalRunner::new("labctl run", board_env(&dir), ProcessRegistry::new());
        let test = TestCase::new("gpio-1", TestType::Integration, "gpioset 0 1=1");

        let spec = runner.build_spec(&test);
        assert!(spec
            .env
            .contains(&("KFORGE_SCRIPT".to_string(), "gpioset 0 1=1".to_string())));
        assert!(spec
            .env
            .contains(&("KFORGE_BOARD".to_string(), "rpi4".to_string())));
        assert!(spec
            .env
            .contains(&("KFORGE_TEST_ID".to_string(), "gpio-1".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lab_command_output_is_result() {
        let dir = TempDir::new().unwrap();
        let runner = PhysicalRunner::new(
            "echo \"board=$KFORGE_BOARD\"; sh -c \"$KFORGE_SCRIPT\"",
            board_env(&dir),
            ProcessRegistry::new(),
        );
        let test = TestCase::new("t", TestType::Unit, "exit 2");

        let result = runner.execute(&test, Duration::from_secs(10)).await.unwrap();
        assert_eq!(result.exit_code, Some(2));
        assert!(result.stdout.contains("board=rpi4"));
    }

    #[test]
    fn test_only_physical_hardware() {
        let dir = TempDir::new().unwrap();
        let runner = PhysicalRunner::new("labctl", board_env(&dir), ProcessRegistry::new());
        assert!(runner.supports_hardware(&HardwareProfile::physical("x86_64", "nuc")));
        assert!(!runner.supports_hardware(&HardwareProfile::virtual_machine(
            "x86_64",
            crate::environment::Emulator::Qemu
        )));
    }
}
