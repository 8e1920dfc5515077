//! Resource limits for container execution.
//!
//! Limits are derived from the test type: performance and fuzz tests get
//! more headroom than unit tests.

use serde::{Deserialize, Serialize};

use crate::model::TestType;

/// Execution resource limits for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
    /// Whether the container may reach the network.
    pub network: bool,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_cores: 1.0,
            max_processes: 256,
            network: false,
        }
    }
}

impl ExecutionLimits {
    /// Creates new execution limits with the given parameters.
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u64, network: bool) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
            network,
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    /// e.g., 1.0 core = 100000 quota (100% of one CPU)
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    /// Docker network mode for these limits.
    pub fn network_mode(&self) -> &'static str {
        if self.network {
            "bridge"
        } else {
            "none"
        }
    }
}

/// Get execution limits for a test type.
///
/// # Example
///
/// ```
/// use kernel_forge::execution::limits_for_test_type;
/// use kernel_forge::model::TestType;
///
/// let limits = limits_for_test_type(TestType::Performance);
/// assert_eq!(limits.memory_mb, 4096);
/// ```
pub fn limits_for_test_type(test_type: TestType) -> ExecutionLimits {
    match test_type {
        TestType::Unit => ExecutionLimits::new(512, 1.0, 128, false),
        TestType::Integration => ExecutionLimits::new(1024, 2.0, 512, true),
        TestType::Performance => ExecutionLimits::new(4096, 4.0, 1024, false),
        TestType::Security => ExecutionLimits::new(1024, 1.0, 256, false),
        TestType::Fuzz => ExecutionLimits::new(2048, 2.0, 1024, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_limits() {
        let limits = limits_for_test_type(TestType::Unit);
        assert_eq!(limits.memory_mb, 512);
        assert_eq!(limits.max_processes, 128);
        assert_eq!(limits.network_mode(), "none");
    }

    #[test]
    fn test_integration_gets_network() {
        let limits = limits_for_test_type(TestType::Integration);
        assert!(limits.network);
        assert_eq!(limits.network_mode(), "bridge");
    }

    #[test]
    fn test_security_isolated() {
        let limits = limits_for_test_type(TestType::Security);
        assert!(!limits.network);
    }

    #[test]
    fn test_memory_bytes_conversion() {
        let limits = ExecutionLimits::new(512, 1.0, 100, false);
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_quota_calculation() {
        let limits = ExecutionLimits::new(512, 2.0, 100, false);
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 200_000);
    }
}
