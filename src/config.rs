//! Orchestrator configuration.
//!
//! Configuration for environment storage, worker pool sizing, timeouts,
//! idle reclamation, execution backends and cost accounting.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::environment::{Emulator, EnvironmentConfig, HardwareProfile};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine used for the container backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEngine {
    /// Docker daemon via its HTTP API.
    Docker,
    /// Host process in its own process group, sandboxed to the
    /// environment's workspace directory.
    Host,
}

impl std::fmt::Display for ContainerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerEngine::Docker => write!(f, "docker"),
            ContainerEngine::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for ContainerEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(ContainerEngine::Docker),
            "host" | "process" => Ok(ContainerEngine::Host),
            other => Err(format!("Unknown container engine: {}", other)),
        }
    }
}

/// Configuration for the orchestration core.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Storage settings
    /// Root directory under which every environment gets its private tree.
    pub storage_root: PathBuf,
    /// Disk image size for new environments (in MB).
    pub disk_size_mb: u64,
    /// Free space below which a health check reports disk shortage (in MB).
    pub min_free_disk_mb: u64,

    // Execution settings
    /// Maximum number of tests running concurrently in a parallel batch.
    pub max_workers: usize,
    /// Timeout applied to a test when the caller gives none.
    pub default_timeout: Duration,

    // Reclamation settings
    /// Idle time after which an environment is reclaimed.
    pub idle_threshold: Duration,
    /// Interval of the background reclaimer.
    pub reclaim_interval: Duration,
    /// How long terminal plans are kept before being purged.
    pub plan_retention: Duration,

    // Backend settings
    /// Engine behind the container backend kind.
    pub container_engine: ContainerEngine,
    /// Image used by the Docker engine.
    pub container_image: String,
    /// Prefix of the QEMU system emulator binaries (arch is appended).
    pub qemu_binary_prefix: String,
    /// Pass `-accel kvm` to QEMU when the guest matches the host arch.
    pub enable_kvm: bool,
    /// Command that runs a script on lab hardware; physical backend is
    /// unavailable when unset.
    pub physical_lab_command: Option<String>,

    // Cost settings
    /// Cost of one environment-hour, used for estimates.
    pub hourly_cost: f64,

    /// Profile used when an environment has to be provisioned on demand.
    pub default_environment: EnvironmentConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./environments"),
            disk_size_mb: 2048,
            min_free_disk_mb: 512,

            max_workers: 4,
            default_timeout: Duration::from_secs(300),

            idle_threshold: Duration::from_secs(1800), // 30 minutes
            reclaim_interval: Duration::from_secs(60),
            plan_retention: Duration::from_secs(24 * 3600),

            container_engine: ContainerEngine::Docker,
            container_image: "debian:bookworm-slim".to_string(),
            qemu_binary_prefix: "qemu-system-".to_string(),
            enable_kvm: false,
            physical_lab_command: None,

            hourly_cost: 0.10,

            default_environment: EnvironmentConfig::new(HardwareProfile::virtual_machine(
                "x86_64",
                Emulator::Qemu,
            )),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KFORGE_STORAGE_ROOT`: Environment storage root (default: ./environments)
    /// - `KFORGE_DISK_SIZE_MB`: Disk image size (default: 2048)
    /// - `KFORGE_MIN_FREE_DISK_MB`: Low-disk threshold (default: 512)
    /// - `KFORGE_MAX_WORKERS`: Parallel workers (default: 4)
    /// - `KFORGE_TEST_TIMEOUT_SECS`: Default test timeout (default: 300)
    /// - `KFORGE_IDLE_THRESHOLD_SECS`: Idle reclamation threshold (default: 1800)
    /// - `KFORGE_RECLAIM_INTERVAL_SECS`: Reclaimer interval (default: 60)
    /// - `KFORGE_PLAN_RETENTION_HOURS`: Terminal plan retention (default: 24)
    /// - `KFORGE_CONTAINER_ENGINE`: `docker` or `host` (default: docker)
    /// - `KFORGE_CONTAINER_IMAGE`: Docker image (default: debian:bookworm-slim)
    /// - `KFORGE_QEMU_PREFIX`: QEMU binary prefix (default: qemu-system-)
    /// - `KFORGE_ENABLE_KVM`: Use KVM acceleration (default: false)
    /// - `KFORGE_LAB_COMMAND`: Physical lab command (default: unset)
    /// - `KFORGE_HOURLY_COST`: Cost per environment-hour (default: 0.10)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage settings
        if let Ok(val) = std::env::var("KFORGE_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("KFORGE_DISK_SIZE_MB") {
            config.disk_size_mb = parse_env_value(&val, "KFORGE_DISK_SIZE_MB")?;
        }

        if let Ok(val) = std::env::var("KFORGE_MIN_FREE_DISK_MB") {
            config.min_free_disk_mb = parse_env_value(&val, "KFORGE_MIN_FREE_DISK_MB")?;
        }

        // Execution settings
        if let Ok(val) = std::env::var("KFORGE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "KFORGE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("KFORGE_TEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "KFORGE_TEST_TIMEOUT_SECS")?;
            config.default_timeout = Duration::from_secs(secs);
        }

        // Reclamation settings
        if let Ok(val) = std::env::var("KFORGE_IDLE_THRESHOLD_SECS") {
            let secs: u64 = parse_env_value(&val, "KFORGE_IDLE_THRESHOLD_SECS")?;
            config.idle_threshold = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("KFORGE_RECLAIM_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "KFORGE_RECLAIM_INTERVAL_SECS")?;
            config.reclaim_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("KFORGE_PLAN_RETENTION_HOURS") {
            let hours: u64 = parse_env_value(&val, "KFORGE_PLAN_RETENTION_HOURS")?;
            config.plan_retention = Duration::from_secs(hours * 3600);
        }

        // Backend settings
        if let Ok(val) = std::env::var("KFORGE_CONTAINER_ENGINE") {
            config.container_engine =
                val.parse()
                    .map_err(|message: String| ConfigError::InvalidValue {
                        key: "KFORGE_CONTAINER_ENGINE".to_string(),
                        message,
                    })?;
        }

        if let Ok(val) = std::env::var("KFORGE_CONTAINER_IMAGE") {
            config.container_image = val;
        }

        if let Ok(val) = std::env::var("KFORGE_QEMU_PREFIX") {
            config.qemu_binary_prefix = val;
        }

        if let Ok(val) = std::env::var("KFORGE_ENABLE_KVM") {
            config.enable_kvm = parse_env_bool(&val, "KFORGE_ENABLE_KVM")?;
        }

        if let Ok(val) = std::env::var("KFORGE_LAB_COMMAND") {
            if !val.trim().is_empty() {
                config.physical_lab_command = Some(val);
            }
        }

        // Cost settings
        if let Ok(val) = std::env::var("KFORGE_HOURLY_COST") {
            config.hourly_cost = parse_env_value(&val, "KFORGE_HOURLY_COST")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.default_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "default_timeout must be greater than 0".to_string(),
            ));
        }

        if self.reclaim_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reclaim_interval must be greater than 0".to_string(),
            ));
        }

        if self.disk_size_mb == 0 {
            return Err(ConfigError::ValidationFailed(
                "disk_size_mb must be greater than 0".to_string(),
            ));
        }

        if self.container_engine == ContainerEngine::Docker && self.container_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "container_image cannot be empty".to_string(),
            ));
        }

        if self.hourly_cost < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "hourly_cost cannot be negative".to_string(),
            ));
        }

        if !self.default_environment.is_virtual() {
            return Err(ConfigError::ValidationFailed(
                "default_environment must be virtual".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the storage root.
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Builder method to set the disk image size.
    pub fn with_disk_size_mb(mut self, size: u64) -> Self {
        self.disk_size_mb = size;
        self
    }

    /// Builder method to set the worker count.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Builder method to set the default test timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builder method to set the idle threshold.
    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    /// Builder method to set the reclaimer interval.
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Builder method to set how long finished plans are kept.
    pub fn with_plan_retention(mut self, retention: Duration) -> Self {
        self.plan_retention = retention;
        self
    }

    /// Builder method to set the container engine.
    pub fn with_container_engine(mut self, engine: ContainerEngine) -> Self {
        self.container_engine = engine;
        self
    }

    /// Builder method to set the Docker image.
    pub fn with_container_image(mut self, image: impl Into<String>) -> Self {
        self.container_image = image.into();
        self
    }

    /// Builder method to set the physical lab command.
    pub fn with_physical_lab_command(mut self, command: impl Into<String>) -> Self {
        self.physical_lab_command = Some(command.into());
        self
    }

    /// Builder method to set the hourly cost.
    pub fn with_hourly_cost(mut self, cost: f64) -> Self {
        self.hourly_cost = cost;
        self
    }

    /// Builder method to set the on-demand environment profile.
    pub fn with_default_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.default_environment = environment;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
