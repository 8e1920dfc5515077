//! Runner registry.
//!
//! Backend kinds are an open set: any [`RunnerProvider`] (including a plain
//! closure) can be registered for a [`BackendKind`], and the selection
//! rules stay untouched.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ContainerEngine, OrchestratorConfig};
use crate::environment::{same_arch, Environment, HardwareProfile};
use crate::error::RunnerError;
use crate::execution::DockerClient;
use crate::model::TestCase;
use crate::process::ProcessRegistry;

use super::container::ContainerRunner;
use super::host::HostRunner;
use super::physical::PhysicalRunner;
use super::selection::select_backend;
use super::vm::VmRunner;
use super::{BackendKind, Runner};

/// Everything a provider needs to bind a runner to an environment.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    /// Snapshot of the target environment.
    pub environment: Environment,
    /// Registry where runners record their live process groups.
    pub processes: ProcessRegistry,
}

/// Creates runners of one backend kind.
pub trait RunnerProvider: Send + Sync {
    fn create(&self, ctx: RunnerContext) -> Result<Box<dyn Runner>, RunnerError>;
}

impl<F> RunnerProvider for F
where
    F: Fn(RunnerContext) -> Result<Box<dyn Runner>, RunnerError> + Send + Sync,
{
    fn create(&self, ctx: RunnerContext) -> Result<Box<dyn Runner>, RunnerError> {
        self(ctx)
    }
}

/// Maps (test, environment) pairs to concrete runners.
#[derive(Clone, Default)]
pub struct RunnerFactory {
    providers: HashMap<BackendKind, Arc<dyn RunnerProvider>>,
    processes: ProcessRegistry,
}

impl RunnerFactory {
    /// Creates an empty factory recording process groups in `processes`.
    pub fn new(processes: ProcessRegistry) -> Self {
        Self {
            providers: HashMap::new(),
            processes,
        }
    }

    /// Creates a factory with the stock backends for `config`.
    ///
    /// The physical backend is only registered when a lab command is
    /// configured.
    pub fn with_defaults(config: &OrchestratorConfig, processes: ProcessRegistry) -> Self {
        let mut factory = Self::new(processes);

        match config.container_engine {
            ContainerEngine::Docker => {
                let image = config.container_image.clone();
                factory.register(
                    BackendKind::Container,
                    move |ctx: RunnerContext| -> Result<Box<dyn Runner>, RunnerError> {
                        let client = DockerClient::new()?;
                        Ok(Box::new(ContainerRunner::new(
                            client,
                            image.clone(),
                            ctx.environment,
                        )))
                    },
                );
            }
            ContainerEngine::Host => {
                factory.register(
                    BackendKind::Container,
                    |ctx: RunnerContext| -> Result<Box<dyn Runner>, RunnerError> {
                        Ok(Box::new(HostRunner::new(ctx.environment, ctx.processes)))
                    },
                );
            }
        }

        let prefix = config.qemu_binary_prefix.clone();
        let enable_kvm = config.enable_kvm;
        factory.register(
            BackendKind::VirtualMachine,
            move |ctx: RunnerContext| -> Result<Box<dyn Runner>, RunnerError> {
                Ok(Box::new(
                    VmRunner::new(ctx.environment, ctx.processes)
                        .with_binary_prefix(prefix.clone())
                        .with_kvm(enable_kvm),
                ))
            },
        );

        if let Some(command) = config.physical_lab_command.clone() {
            factory.register(
                BackendKind::Physical,
                move |ctx: RunnerContext| -> Result<Box<dyn Runner>, RunnerError> {
                    Ok(Box::new(PhysicalRunner::new(
                        command.clone(),
                        ctx.environment,
                        ctx.processes,
                    )))
                },
            );
        }

        factory
    }

    /// Registers (or replaces) the provider for `kind`.
    pub fn register(&mut self, kind: BackendKind, provider: impl RunnerProvider + 'static) {
        debug!(backend = %kind, "Registered runner provider");
        self.providers.insert(kind, Arc::new(provider));
    }

    /// Returns true if a provider is registered for `kind`.
    pub fn is_registered(&self, kind: &BackendKind) -> bool {
        self.providers.contains_key(kind)
    }

    /// Registered backend kinds.
    pub fn registered_kinds(&self) -> Vec<BackendKind> {
        self.providers.keys().cloned().collect()
    }

    /// Backend kind that would run `test` on `env`.
    pub fn select_backend(&self, test: &TestCase, env: &Environment) -> BackendKind {
        select_backend(test, &env.hardware)
    }

    /// Creates the runner selected for `test` on `env`.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::BackendUnavailable` if nothing is registered
    /// for the selected kind.
    pub fn create_runner(
        &self,
        test: &TestCase,
        env: &Environment,
    ) -> Result<Box<dyn Runner>, RunnerError> {
        let kind = self.select_backend(test, env);
        self.create_runner_with_kind(&kind, env)
    }

    /// Creates a runner of an explicit kind, bypassing selection.
    pub fn create_runner_with_kind(
        &self,
        kind: &BackendKind,
        env: &Environment,
    ) -> Result<Box<dyn Runner>, RunnerError> {
        let provider = self
            .providers
            .get(kind)
            .ok_or_else(|| RunnerError::BackendUnavailable(kind.to_string()))?;
        provider.create(RunnerContext {
            environment: env.clone(),
            processes: self.processes.clone(),
        })
    }

    /// Returns true if a runner can be created for `test` on `env`, it
    /// supports the test type and hardware, and the environment satisfies
    /// the test's hardware requirements.
    pub fn validate_compatibility(&self, test: &TestCase, env: &Environment) -> bool {
        let runner = match self.create_runner(test, env) {
            Ok(runner) => runner,
            Err(e) => {
                debug!(test_id = %test.id, env_id = %env.id, error = %e, "Incompatible: no runner");
                return false;
            }
        };
        runner.supports_test_type(test.test_type)
            && runner.supports_hardware(&env.hardware)
            && requirements_met(test, &env.hardware)
    }
}

/// Returns true if `profile` satisfies the test's hardware requirements.
pub fn requirements_met(test: &TestCase, profile: &HardwareProfile) -> bool {
    let req = &test.required_hardware;
    if let Some(arch) = &req.architecture {
        if !same_arch(arch, &profile.architecture) {
            return false;
        }
    }
    if let Some(is_virtual) = req.is_virtual {
        if is_virtual != profile.is_virtual {
            return false;
        }
    }
    req.peripherals.iter().all(|p| profile.has_peripheral(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Emulator, EnvironmentStatus, Peripheral};
    use crate::model::{ExecutionResult, HardwareRequirements, TestType};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn env_with(hardware: HardwareProfile) -> Environment {
        Environment {
            id: "env-test".to_string(),
            hardware,
            status: EnvironmentStatus::Idle,
            created_at: Utc::now(),
            last_used: Utc::now(),
            kernel_version: None,
            storage_dir: std::env::temp_dir().join("env-test"),
            disk_image: None,
            kernel_image: None,
            metadata: BTreeMap::new(),
        }
    }

    fn host_factory() -> RunnerFactory {
        let config = OrchestratorConfig::default().with_container_engine(ContainerEngine::Host);
        RunnerFactory::with_defaults(&config, ProcessRegistry::new())
    }

    struct EchoRunner;

    #[async_trait]
    impl Runner for EchoRunner {
        fn kind(&self) -> BackendKind {
            BackendKind::Custom("echo".to_string())
        }

        async fn execute(
            &self,
            test: &TestCase,
            _timeout: Duration,
        ) -> Result<ExecutionResult, RunnerError> {
            Ok(ExecutionResult {
                exit_code: Some(0),
                stdout: test.script.clone(),
                ..Default::default()
            })
        }

        async fn cleanup(&self) -> Result<(), RunnerError> {
            Ok(())
        }

        fn supports_test_type(&self, _test_type: TestType) -> bool {
            true
        }

        fn supports_hardware(&self, _profile: &HardwareProfile) -> bool {
            true
        }
    }

    #[test]
    fn test_physical_unregistered_without_lab_command() {
        let factory = host_factory();
        let env = env_with(HardwareProfile::physical("aarch64", "rpi4"));
        let test = TestCase::new("t", TestType::Unit, "true");

        assert_eq!(factory.select_backend(&test, &env), BackendKind::Physical);
        let err = factory.create_runner(&test, &env).err().unwrap();
        assert!(matches!(err, RunnerError::BackendUnavailable(_)));
        assert!(!factory.validate_compatibility(&test, &env));
    }

    #[test]
    fn test_physical_registered_with_lab_command() {
        let config = OrchestratorConfig::default()
            .with_container_engine(ContainerEngine::Host)
            .with_physical_lab_command("labctl run");
        let factory = RunnerFactory::with_defaults(&config, ProcessRegistry::new());
        let env = env_with(HardwareProfile::physical("aarch64", "rpi4"));
        let test = TestCase::new("t", TestType::Performance, "true");

        let runner = factory.create_runner(&test, &env).unwrap();
        assert_eq!(runner.kind(), BackendKind::Physical);
        assert!(factory.validate_compatibility(&test, &env));
    }

    #[test]
    fn test_unit_test_gets_host_container_runner() {
        let factory = host_factory();
        let env = env_with(HardwareProfile::virtual_machine("x86_64", Emulator::Host));
        let test = TestCase::new("t", TestType::Unit, "true");

        let runner = factory.create_runner(&test, &env).unwrap();
        assert_eq!(runner.kind(), BackendKind::Container);
        assert!(factory.validate_compatibility(&test, &env));
    }

    #[test]
    fn test_vm_runner_rejects_non_qemu_environment() {
        let factory = host_factory();
        let env = env_with(HardwareProfile::virtual_machine("x86_64", Emulator::Host));
        let test = TestCase::new("t", TestType::Fuzz, "syzkaller");

        assert_eq!(
            factory.create_runner(&test, &env).unwrap().kind(),
            BackendKind::VirtualMachine
        );
        assert!(!factory.validate_compatibility(&test, &env));
    }

    #[test]
    fn test_requirements_checked() {
        let factory = host_factory();
        let hw = HardwareProfile::virtual_machine("x86_64", Emulator::Host)
            .with_peripheral(Peripheral::new("usb0", "usb"));
        let env = env_with(hw);

        let wrong_arch = TestCase::new("t", TestType::Unit, "true").with_requirements(
            HardwareRequirements {
                architecture: Some("riscv64".to_string()),
                ..Default::default()
            },
        );
        assert!(!factory.validate_compatibility(&wrong_arch, &env));

        let needs_usb = TestCase::new("t", TestType::Unit, "true").with_requirements(
            HardwareRequirements {
                peripherals: vec!["usb0".to_string()],
                ..Default::default()
            },
        );
        assert!(requirements_met(&needs_usb, &env.hardware));
    }

    #[tokio::test]
    async fn test_custom_kind_registration() {
        let mut factory = host_factory();
        let kind = BackendKind::Custom("echo".to_string());
        factory.register(
            kind.clone(),
            |_ctx: RunnerContext| -> Result<Box<dyn Runner>, RunnerError> {
                Ok(Box::new(EchoRunner))
            },
        );
        assert!(factory.is_registered(&kind));

        let env = env_with(HardwareProfile::virtual_machine("x86_64", Emulator::Host));
        let test = TestCase::new("t", TestType::Unit, "hello");
        let runner = factory.create_runner_with_kind(&kind, &env).unwrap();
        let result = runner.execute(&test, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.stdout, "hello");
    }
}
