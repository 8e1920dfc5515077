//! Test case definitions.

use serde::{Deserialize, Serialize};

/// Category of a kernel test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    /// Self-contained unit test.
    Unit,
    /// Integration test across subsystems.
    Integration,
    /// Benchmark that needs dedicated resources.
    Performance,
    /// Security test that needs strong isolation.
    Security,
    /// Fuzzing campaign that may crash the kernel.
    Fuzz,
}

impl TestType {
    /// All test types, in declaration order.
    pub const ALL: [TestType; 5] = [
        TestType::Unit,
        TestType::Integration,
        TestType::Performance,
        TestType::Security,
        TestType::Fuzz,
    ];

    /// Returns the lowercase name of this test type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Unit => "unit",
            TestType::Integration => "integration",
            TestType::Performance => "performance",
            TestType::Security => "security",
            TestType::Fuzz => "fuzz",
        }
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unit" => Ok(TestType::Unit),
            "integration" => Ok(TestType::Integration),
            "performance" | "perf" => Ok(TestType::Performance),
            "security" => Ok(TestType::Security),
            "fuzz" | "fuzzing" => Ok(TestType::Fuzz),
            other => Err(format!("Unknown test type: {}", other)),
        }
    }
}

/// Hardware a test needs from the environment it runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRequirements {
    /// Required CPU architecture, if any.
    #[serde(default)]
    pub architecture: Option<String>,
    /// Peripherals that must be attached (e.g. "can0", "nvme").
    #[serde(default)]
    pub peripherals: Vec<String>,
    /// Whether the test insists on virtual (`Some(true)`) or physical
    /// (`Some(false)`) hardware.
    #[serde(default)]
    pub is_virtual: Option<bool>,
}

/// Outcome a test is expected to produce when it passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    /// Exit code that counts as a pass.
    #[serde(default)]
    pub exit_code: i32,
    /// Text that must appear in stdout for a pass.
    #[serde(default)]
    pub output_contains: Option<String>,
}

/// A single kernel test to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique test identifier.
    pub id: String,
    /// Human-readable name; empty means "same as the id".
    #[serde(default)]
    pub name: String,
    /// Free-form description; scanned during backend selection.
    #[serde(default)]
    pub description: String,
    /// Test category.
    pub test_type: TestType,
    /// Kernel subsystem under test (e.g. "mm", "net", "drivers/gpio").
    #[serde(default)]
    pub target_subsystem: String,
    /// Hardware the test needs.
    #[serde(default)]
    pub required_hardware: HardwareRequirements,
    /// Shell script or command line executed by the backend.
    pub script: String,
    /// Estimated execution time in seconds.
    #[serde(default = "default_execution_time")]
    pub execution_time_estimate: u64,
    /// Pass criterion overriding "exit code 0".
    #[serde(default)]
    pub expected_outcome: Option<ExpectedOutcome>,
}

fn default_execution_time() -> u64 {
    60
}

impl TestCase {
    /// Creates a test case with the given id, type and script.
    ///
    /// The name defaults to the id.
    pub fn new(id: impl Into<String>, test_type: TestType, script: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            test_type,
            target_subsystem: String::new(),
            required_hardware: HardwareRequirements::default(),
            script: script.into(),
            execution_time_estimate: default_execution_time(),
            expected_outcome: None,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the target subsystem.
    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.target_subsystem = subsystem.into();
        self
    }

    /// Sets the required hardware.
    pub fn with_requirements(mut self, requirements: HardwareRequirements) -> Self {
        self.required_hardware = requirements;
        self
    }

    /// Sets the expected outcome.
    pub fn with_expected_outcome(mut self, outcome: ExpectedOutcome) -> Self {
        self.expected_outcome = Some(outcome);
        self
    }

    /// Sets the execution time estimate in seconds.
    pub fn with_estimate(mut self, seconds: u64) -> Self {
        self.execution_time_estimate = seconds;
        self
    }
}
