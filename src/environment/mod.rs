//! Ephemeral test environments.
//!
//! An environment is an isolated execution context with a private directory
//! tree:
//!
//! ```text
//! <storage_root>/<env_id>/
//!     disk.qcow2 | disk.img
//!     kernel.img            (after deploy)
//!     logs/  cores/  traces/
//!     workspace/
//! ```
//!
//! Lifecycle:
//! ```text
//! PROVISIONING → IDLE ⇄ BUSY
//!       any    → ERROR
//!       any    → removed (cleanup)
//! ```

pub mod backend;
pub mod manager;
pub mod types;

pub use backend::{ImageFileBackend, ProvisioningBackend, QemuBackend};
pub use manager::EnvironmentManager;
pub use types::{
    normalize_arch, same_arch, Emulator, Environment, EnvironmentConfig, EnvironmentStatus,
    HardwareProfile, HealthReport, KernelImage, Peripheral, StorageType,
};
