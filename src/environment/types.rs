//! Environment data types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::EnvironmentRef;

/// Lifecycle state of an environment.
///
/// ```text
/// PROVISIONING → IDLE ⇄ BUSY
///       any    → ERROR
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Provisioning,
    Idle,
    Busy,
    Error,
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentStatus::Provisioning => write!(f, "provisioning"),
            EnvironmentStatus::Idle => write!(f, "idle"),
            EnvironmentStatus::Busy => write!(f, "busy"),
            EnvironmentStatus::Error => write!(f, "error"),
        }
    }
}

/// Virtualization technology backing a virtual environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emulator {
    /// Full system emulation / KVM.
    Qemu,
    /// Docker container.
    Docker,
    /// Plain host process sandbox.
    Host,
}

impl std::fmt::Display for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Emulator::Qemu => write!(f, "qemu"),
            Emulator::Docker => write!(f, "docker"),
            Emulator::Host => write!(f, "host"),
        }
    }
}

/// Kind of storage backing the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Ssd,
    Hdd,
    Nvme,
    Emmc,
}

/// A peripheral attached to an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl Peripheral {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            model: None,
        }
    }
}

/// Hardware description of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub architecture: String,
    #[serde(default = "default_cpu_model")]
    pub cpu_model: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default = "default_true")]
    pub is_virtual: bool,
    /// Virtualization technology; `None` for physical boards.
    #[serde(default)]
    pub emulator: Option<Emulator>,
    /// Board name for physical hardware (e.g. "rpi4").
    #[serde(default)]
    pub board_type: Option<String>,
    #[serde(default)]
    pub peripherals: Vec<Peripheral>,
}

fn default_cpu_model() -> String {
    "generic".to_string()
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_true() -> bool {
    true
}

impl HardwareProfile {
    /// Virtual profile for the given architecture and emulator.
    pub fn virtual_machine(architecture: impl Into<String>, emulator: Emulator) -> Self {
        Self {
            architecture: architecture.into(),
            cpu_model: default_cpu_model(),
            memory_mb: default_memory_mb(),
            storage_type: StorageType::default(),
            is_virtual: true,
            emulator: Some(emulator),
            board_type: None,
            peripherals: Vec::new(),
        }
    }

    /// Physical board profile.
    pub fn physical(architecture: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            cpu_model: default_cpu_model(),
            memory_mb: default_memory_mb(),
            storage_type: StorageType::default(),
            is_virtual: false,
            emulator: None,
            board_type: Some(board.into()),
            peripherals: Vec::new(),
        }
    }

    pub fn with_peripheral(mut self, peripheral: Peripheral) -> Self {
        self.peripherals.push(peripheral);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_cpu_model(mut self, cpu_model: impl Into<String>) -> Self {
        self.cpu_model = cpu_model.into();
        self
    }

    /// Board label used when grouping results.
    pub fn board_label(&self) -> String {
        match (&self.board_type, self.emulator) {
            (Some(board), _) => board.clone(),
            (None, Some(emulator)) => format!("virtual-{}", emulator),
            (None, None) => "physical".to_string(),
        }
    }

    /// Peripheral configuration label used when grouping results.
    ///
    /// Sorted peripheral names joined by `+`, or `none`.
    pub fn peripheral_label(&self) -> String {
        if self.peripherals.is_empty() {
            return "none".to_string();
        }
        let mut names: Vec<&str> = self.peripherals.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.join("+")
    }

    /// Returns true if a peripheral with `name` is attached.
    pub fn has_peripheral(&self, name: &str) -> bool {
        self.peripherals.iter().any(|p| p.name == name)
    }
}

/// Canonical architecture name, so that aliases compare equal.
pub fn normalize_arch(arch: &str) -> String {
    match arch.to_lowercase().as_str() {
        "amd64" | "x86-64" | "x64" => "x86_64".to_string(),
        "arm64" | "armv8" => "aarch64".to_string(),
        "i386" | "i686" => "x86".to_string(),
        other => other.to_string(),
    }
}

/// Returns true if two architecture names refer to the same ISA.
pub fn same_arch(a: &str, b: &str) -> bool {
    normalize_arch(a) == normalize_arch(b)
}

/// Request to provision a new environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub hardware: HardwareProfile,
    /// Disk image size override in MB.
    #[serde(default)]
    pub disk_size_mb: Option<u64>,
    /// Free-form labels copied into environment metadata.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    pub fn new(hardware: HardwareProfile) -> Self {
        Self {
            hardware,
            disk_size_mb: None,
            labels: BTreeMap::new(),
        }
    }

    /// Convenience accessor for the virtual flag.
    pub fn is_virtual(&self) -> bool {
        self.hardware.is_virtual
    }

    pub fn with_disk_size_mb(mut self, size: u64) -> Self {
        self.disk_size_mb = Some(size);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A kernel image to deploy into an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelImage {
    pub path: PathBuf,
    pub architecture: String,
    pub version: String,
}

impl KernelImage {
    pub fn new(
        path: impl Into<PathBuf>,
        architecture: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            architecture: architecture.into(),
            version: version.into(),
        }
    }
}

/// An ephemeral test environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub id: String,
    pub hardware: HardwareProfile,
    pub status: EnvironmentStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub kernel_version: Option<String>,
    /// Private directory tree owned by this environment.
    pub storage_dir: PathBuf,
    /// Backend disk image inside `storage_dir`.
    pub disk_image: Option<PathBuf>,
    /// Deployed kernel inside `storage_dir`.
    pub kernel_image: Option<PathBuf>,
    pub metadata: BTreeMap<String, String>,
}

impl Environment {
    pub fn logs_dir(&self) -> PathBuf {
        self.storage_dir.join(LOGS_DIR)
    }

    pub fn cores_dir(&self) -> PathBuf {
        self.storage_dir.join(CORES_DIR)
    }

    pub fn traces_dir(&self) -> PathBuf {
        self.storage_dir.join(TRACES_DIR)
    }

    /// Scratch directory where host-side runners execute scripts.
    pub fn workspace_dir(&self) -> PathBuf {
        self.storage_dir.join(WORKSPACE_DIR)
    }

    /// Snapshot reference stored on results.
    pub fn reference(&self) -> EnvironmentRef {
        EnvironmentRef {
            id: self.id.clone(),
            architecture: self.hardware.architecture.clone(),
            board_type: self.hardware.board_label(),
            peripheral_config: self.hardware.peripheral_label(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == EnvironmentStatus::Idle
    }
}

pub const LOGS_DIR: &str = "logs";
pub const CORES_DIR: &str = "cores";
pub const TRACES_DIR: &str = "traces";
pub const WORKSPACE_DIR: &str = "workspace";

/// Result of a read-only health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub environment_id: String,
    pub status: EnvironmentStatus,
    pub healthy: bool,
    /// Free bytes on the filesystem holding the environment, if known.
    pub disk_available_bytes: Option<u64>,
    pub disk_space_low: bool,
    pub in_error_state: bool,
    pub uptime_seconds: i64,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_arch_aliases() {
        assert!(same_arch("arm64", "aarch64"));
        assert!(same_arch("amd64", "x86_64"));
        assert!(!same_arch("x86_64", "riscv64"));
    }

    #[test]
    fn test_labels() {
        let hw = HardwareProfile::virtual_machine("x86_64", Emulator::Qemu)
            .with_peripheral(Peripheral::new("usb0", "usb"))
            .with_peripheral(Peripheral::new("can0", "can"));
        assert_eq!(hw.board_label(), "virtual-qemu");
        assert_eq!(hw.peripheral_label(), "can0+usb0");

        let board = HardwareProfile::physical("aarch64", "rpi4");
        assert_eq!(board.board_label(), "rpi4");
        assert_eq!(board.peripheral_label(), "none");
    }

    #[test]
    fn test_hardware_profile_yaml_defaults() {
        let yaml = "architecture: riscv64\nemulator: qemu\n";
        let hw: HardwareProfile = serde_yaml::from_str(yaml).unwrap();
        assert!(hw.is_virtual);
        assert_eq!(hw.memory_mb, 2048);
        assert_eq!(hw.emulator, Some(Emulator::Qemu));
    }
}
