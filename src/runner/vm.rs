//! QEMU virtual machine backend.
//!
//! Boots the environment's deployed kernel with its disk image attached and
//! the workspace shared over 9p. The guest init is expected to run the
//! wrapper script named on the kernel command line and print its exit
//! status as `KFORGE_EXIT_CODE=<n>` on the serial console. `panic=-1` and
//! `-no-reboot` turn a kernel panic into a QEMU exit.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::environment::{normalize_arch, Emulator, Environment, HardwareProfile};
use crate::error::RunnerError;
use crate::model::{ExecutionResult, TestCase, TestType};
use crate::process::{run_process_group, ProcessRegistry, ProcessSpec};

use super::{script_env, BackendKind, Runner};

/// 9p mount tag the guest mounts the workspace from.
pub const WORKSPACE_MOUNT_TAG: &str = "kforge";

static EXIT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*KFORGE_EXIT_CODE=(-?\d+)\s*$").expect("exit marker regex is valid")
});

/// Runs tests inside a QEMU system emulator.
pub struct VmRunner {
    environment: Environment,
    processes: ProcessRegistry,
    binary_prefix: String,
    enable_kvm: bool,
}

impl VmRunner {
    pub fn new(environment: Environment, processes: ProcessRegistry) -> Self {
        Self {
            environment,
            processes,
            binary_prefix: "qemu-system-".to_string(),
            enable_kvm: false,
        }
    }

    /// Sets the emulator binary prefix; the QEMU architecture is appended.
    pub fn with_binary_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.binary_prefix = prefix.into();
        self
    }

    /// Requests KVM acceleration when guest and host architectures match.
    pub fn with_kvm(mut self, enable: bool) -> Self {
        self.enable_kvm = enable;
        self
    }

    /// Emulator binary for this environment's architecture.
    pub fn binary(&self) -> String {
        format!(
            "{}{}",
            self.binary_prefix,
            qemu_arch(&self.environment.hardware.architecture)
        )
    }

    fn workspace(&self) -> PathBuf {
        self.environment.workspace_dir()
    }

    /// Writes the wrapper script the guest runs and returns its file name.
    async fn write_wrapper(&self, test: &TestCase) -> Result<String, RunnerError> {
        let file_name = format!("run-{}.sh", cmdline_token(&test.id));
        let mut body = String::from("#!/bin/sh\n");
        for (key, value) in script_env(test, &self.environment.id) {
            body.push_str(&format!("export {}='{}'\n", key, value.replace('\'', "'\\''")));
        }
        body.push_str("(\n");
        body.push_str(&test.script);
        body.push_str("\n)\n");
        body.push_str("echo \"KFORGE_EXIT_CODE=$?\"\n");

        tokio::fs::write(self.workspace().join(&file_name), body).await?;
        Ok(file_name)
    }

    fn build_spec(&self, test: &TestCase, wrapper: &str) -> Result<ProcessSpec, RunnerError> {
        let env = &self.environment;
        let kernel = env.kernel_image.as_ref().ok_or_else(|| {
            RunnerError::Setup(format!("No kernel deployed to environment '{}'", env.id))
        })?;

        let mut args = vec![
            "-nographic".to_string(),
            "-no-reboot".to_string(),
            "-m".to_string(),
            env.hardware.memory_mb.to_string(),
            "-kernel".to_string(),
            kernel.display().to_string(),
        ];

        if let Some(disk) = &env.disk_image {
            let format = if disk.extension().is_some_and(|ext| ext == "qcow2") {
                "qcow2"
            } else {
                "raw"
            };
            args.push("-drive".to_string());
            args.push(format!("file={},format={},if=virtio", disk.display(), format));
        }

        args.push("-virtfs".to_string());
        args.push(format!(
            "local,path={},mount_tag={},security_model=none",
            self.workspace().display(),
            WORKSPACE_MOUNT_TAG
        ));

        if self.enable_kvm && normalize_arch(&env.hardware.architecture) == normalize_arch(std::env::consts::ARCH) {
            args.push("-accel".to_string());
            args.push("kvm".to_string());
        }

        args.push("-append".to_string());
        args.push(format!(
            "console={} panic=-1 kforge.script={} kforge.test={}",
            console_device(&env.hardware.architecture),
            wrapper,
            cmdline_token(&test.id)
        ));

        Ok(ProcessSpec::new(self.binary())
            .with_args(args)
            .with_current_dir(self.workspace()))
    }
}

/// Maps an architecture name to the QEMU system emulator suffix.
/// Reduces a test id to characters safe in a file name and as a single
/// kernel command-line token.
fn cmdline_token(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn qemu_arch(arch: &str) -> String {
    match normalize_arch(arch).as_str() {
        "x86" => "i386".to_string(),
        "armv7" | "armhf" => "arm".to_string(),
        other => other.to_string(),
    }
}

fn console_device(arch: &str) -> &'static str {
    match normalize_arch(arch).as_str() {
        "x86_64" | "x86" => "ttyS0",
        _ => "ttyAMA0",
    }
}

/// Extracts the guest script's exit status from serial console output.
///
/// The last marker wins.
pub fn parse_exit_marker(output: &str) -> Option<i32> {
    EXIT_MARKER
        .captures_iter(output)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .last()
}

#[async_trait]
impl Runner for VmRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::VirtualMachine
    }

    async fn execute(
        &self,
        test: &TestCase,
        timeout: Duration,
    ) -> Result<ExecutionResult, RunnerError> {
        tokio::fs::create_dir_all(self.workspace()).await?;
        let wrapper = self.write_wrapper(test).await?;
        let spec = self.build_spec(test, &wrapper)?;

        debug!(
            env_id = %self.environment.id,
            test_id = %test.id,
            command = %spec.display(),
            "Booting test VM"
        );
        let output = run_process_group(
            &spec,
            timeout,
            Some((&self.processes, self.environment.id.as_str())),
        )
        .await?;

        let exit_code = if output.timed_out {
            None
        } else {
            match parse_exit_marker(&output.stdout) {
                Some(code) => Some(code),
                None => {
                    // No marker: the guest never finished the script (panic,
                    // boot failure). A failing emulator keeps its own code.
                    warn!(test_id = %test.id, qemu_exit = ?output.exit_code, "No exit marker in VM console output");
                    output.exit_code.filter(|code| *code != 0)
                }
            }
        };

        if let Err(e) = tokio::fs::remove_file(self.workspace().join(&wrapper)).await {
            debug!(error = %e, "Failed to remove VM wrapper script");
        }

        Ok(ExecutionResult {
            exit_code,
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
        profile.is_virtual && profile.emulator == Some(Emulator::Qemu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn vm_env(dir: &TempDir, kernel: Option<PathBuf>) -> Environment {
        Environment {
            id: "env-vm".to_string(),
            hardware: HardwareProfile::virtual_machine("arm64", Emulator::Qemu),
            status: EnvironmentStatus::Busy,
            created_at: Utc::now(),
            last_used: Utc::now(),
            kernel_version: None,
            storage_dir: dir.path().to_path_buf(),
            disk_image: Some(dir.path().join("disk.qcow2")),
            kernel_image: kernel,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_parse_exit_marker() {
        let console = "Booting Linux...\nKFORGE_EXIT_CODE=0\n";
        assert_eq!(parse_exit_marker(console), Some(0));

        let twice = "KFORGE_EXIT_CODE=1\nretry\nKFORGE_EXIT_CODE=7\n";
        assert_eq!(parse_exit_marker(twice), Some(7));

        assert_eq!(parse_exit_marker("Kernel panic - not syncing"), None);
        assert_eq!(parse_exit_marker("echo KFORGE_EXIT_CODE=$?"), None);
    }

    #[test]
    fn test_qemu_arch_mapping() {
        assert_eq!(qemu_arch("amd64"), "x86_64");
        assert_eq!(qemu_arch("arm64"), "aarch64");
        assert_eq!(qemu_arch("i686"), "i386");
        assert_eq!(qemu_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_build_spec_requires_kernel() {
        let dir = TempDir::new().unwrap();
        let runner = VmRunner::new(vm_env(&dir, None), ProcessRegistry::new());
        let test = TestCase::new("t", TestType::Fuzz, "true");
        assert!(matches!(
            runner.build_spec(&test, "run-t.sh"),
            Err(RunnerError::Setup(_))
        ));
    }

    #[test]
    fn test_build_spec_arguments() {
        let dir = TempDir::new().unwrap();
        let kernel = dir.path().join("kernel.img");
        let runner = VmRunner::new(vm_env(&dir, Some(kernel)), ProcessRegistry::new())
            .with_binary_prefix("/opt/qemu/bin/qemu-system-");
        let test = TestCase::new("t", TestType::Performance, "true");

        let spec = runner.build_spec(&test, "run-t.sh").unwrap();
        assert_eq!(spec.program, "/opt/qemu/bin/qemu-system-aarch64");
        assert!(spec.args.iter().any(|a| a.contains("format=qcow2")));
        assert!(spec.args.iter().any(|a| a.contains("mount_tag=kforge")));
        let append = spec.args.last().unwrap();
        assert!(append.contains("console=ttyAMA0"));
        assert!(append.contains("kforge.script=run-t.sh"));
    }

    #[test]
    fn test_build_spec_keeps_test_id_one_token() {
        let dir = TempDir::new().unwrap();
        let kernel = dir.path().join("kernel.img");
        let runner = VmRunner::new(vm_env(&dir, Some(kernel)), ProcessRegistry::new());
        let test = TestCase::new("net/ping 'lo' init=/bin/sh", TestType::Integration, "true");

        let spec = runner.build_spec(&test, "run-x.sh").unwrap();
        let append = spec.args.last().unwrap();
        assert!(append.ends_with("kforge.test=net_ping__lo__init__bin_sh"));
        assert!(!append.contains("init=/bin/sh"));
        assert_eq!(append.split_whitespace().count(), 4);
    }

    #[test]
    fn test_hardware_support() {
        let dir = TempDir::new().unwrap();
        let runner = VmRunner::new(vm_env(&dir, None), ProcessRegistry::new());
        assert!(runner.supports_hardware(&HardwareProfile::virtual_machine("x86_64", Emulator::Qemu)));
        assert!(!runner.supports_hardware(&HardwareProfile::virtual_machine("x86_64", Emulator::Docker)));
        assert!(!runner.supports_hardware(&HardwareProfile::physical("aarch64", "rpi4")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_with_fake_emulator() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let bin_dir = dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let fake = bin_dir.join("fake-qemu-aarch64");
        std::fs::write(&fake, "#!/bin/sh\necho booting\necho KFORGE_EXIT_CODE=4\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let kernel = dir.path().join("kernel.img");
        let prefix = format!("{}/fake-qemu-", bin_dir.display());
        let runner = VmRunner::new(vm_env(&dir, Some(kernel)), ProcessRegistry::new())
            .with_binary_prefix(prefix);
        let test = TestCase::new("t", TestType::Fuzz, "exit 4");

        let result = runner.execute(&test, Duration::from_secs(10)).await.unwrap();
        assert_eq!(result.exit_code, Some(4));
        assert!(!result.timed_out);
        assert!(!dir.path().join("workspace/run-t.sh").exists());
    }
}
