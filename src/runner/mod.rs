//! Execution backends.
//!
//! A [`Runner`] executes one test on one environment. Which backend runs a
//! test is decided by the pure rule table in [`selection`]; the
//! [`RunnerFactory`] maps the chosen [`BackendKind`] to a registered
//! implementation.
//!
//! ```text
//! (TestCase, Environment) → select_backend → BackendKind → RunnerProvider → Runner
//! ```
//!
//! Stock backends:
//! - `Container`: Docker ([`ContainerRunner`]) or a host process group
//!   ([`HostRunner`]), depending on configuration
//! - `VirtualMachine`: QEMU system emulator ([`VmRunner`])
//! - `Physical`: external lab command ([`PhysicalRunner`])

pub mod container;
pub mod factory;
pub mod host;
pub mod physical;
pub mod selection;
pub mod vm;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::environment::HardwareProfile;
use crate::error::RunnerError;
use crate::model::{ExecutionResult, TestCase, TestType};

pub use container::ContainerRunner;
pub use factory::{RunnerContext, RunnerFactory, RunnerProvider};
pub use host::HostRunner;
pub use physical::PhysicalRunner;
pub use selection::select_backend;
pub use vm::VmRunner;

/// Execution technology behind a [`Runner`].
///
/// The set is open: `Custom` kinds are registered on the factory without
/// touching the selection rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Lightweight isolated process (container).
    Container,
    /// Full virtual machine with its own kernel.
    VirtualMachine,
    /// Physical lab hardware.
    Physical,
    /// Externally registered backend.
    Custom(String),
}

impl BackendKind {
    /// Label used for logs and metrics.
    pub fn label(&self) -> &str {
        match self {
            BackendKind::Container => "container",
            BackendKind::VirtualMachine => "virtual_machine",
            BackendKind::Physical => "physical",
            BackendKind::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container" => Ok(BackendKind::Container),
            "vm" | "virtual_machine" | "virtual-machine" => Ok(BackendKind::VirtualMachine),
            "physical" | "hardware" => Ok(BackendKind::Physical),
            "" => Err("Empty backend kind".to_string()),
            other => Ok(BackendKind::Custom(other.to_string())),
        }
    }
}

/// Capability interface of an execution backend.
///
/// A runner is bound to one environment when it is created. `execute` must
/// enforce `timeout` itself by killing everything it started, and report it
/// through [`ExecutionResult::timed_out`] rather than an error.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Backend kind of this runner.
    fn kind(&self) -> BackendKind;

    /// Runs the test's script and returns its raw output.
    async fn execute(
        &self,
        test: &TestCase,
        timeout: Duration,
    ) -> Result<ExecutionResult, RunnerError>;

    /// Releases anything the runner still holds.
    async fn cleanup(&self) -> Result<(), RunnerError>;

    /// Returns true if this backend can run tests of `test_type`.
    fn supports_test_type(&self, test_type: TestType) -> bool;

    /// Returns true if this backend can drive `profile`.
    fn supports_hardware(&self, profile: &HardwareProfile) -> bool;
}

/// Environment variables exported to every test script.
pub(crate) fn script_env(test: &TestCase, env_id: &str) -> Vec<(String, String)> {
    vec![
        ("KFORGE_TEST_ID".to_string(), test.id.clone()),
        ("KFORGE_TEST_TYPE".to_string(), test.test_type.to_string()),
        (
            "KFORGE_TEST_SUBSYSTEM".to_string(),
            test.target_subsystem.clone(),
        ),
        ("KFORGE_ENV_ID".to_string(), env_id.to_string()),
    ]
}
