//! Provisioning backends.
//!
//! A backend creates the disk image that lives inside an environment's
//! private directory. Backend internals are opaque to the manager: any
//! failure surfaces as [`EnvironmentError::Provision`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::EnvironmentError;
use crate::process::{run_process_group, ProcessSpec};

const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(120);

/// Creates backend-specific storage for a new environment.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Short backend name for logs and metadata.
    fn name(&self) -> &'static str;

    /// Creates a disk image of `size_mb` inside `storage_dir` and returns
    /// its path.
    async fn create_disk(
        &self,
        env_id: &str,
        storage_dir: &Path,
        size_mb: u64,
    ) -> Result<PathBuf, EnvironmentError>;
}

/// QEMU-class backend: a qcow2 disk created with `qemu-img`.
#[derive(Debug, Clone)]
pub struct QemuBackend {
    qemu_img: String,
}

impl QemuBackend {
    pub fn new(qemu_img: impl Into<String>) -> Self {
        Self {
            qemu_img: qemu_img.into(),
        }
    }
}

impl Default for QemuBackend {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

#[async_trait]
impl ProvisioningBackend for QemuBackend {
    fn name(&self) -> &'static str {
        "qemu"
    }

    async fn create_disk(
        &self,
        env_id: &str,
        storage_dir: &Path,
        size_mb: u64,
    ) -> Result<PathBuf, EnvironmentError> {
        let disk = storage_dir.join("disk.qcow2");
        let spec = ProcessSpec::new(&self.qemu_img).with_args(vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            disk.display().to_string(),
            format!("{}M", size_mb),
        ]);

        let output = run_process_group(&spec, QEMU_IMG_TIMEOUT, None)
            .await
            .map_err(|e| EnvironmentError::Provision {
                env_id: env_id.to_string(),
                reason: e.to_string(),
            })?;

        if output.timed_out || output.exit_code != Some(0) {
            return Err(EnvironmentError::Provision {
                env_id: env_id.to_string(),
                reason: format!(
                    "{} exited with {:?}: {}",
                    self.qemu_img,
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }

        debug!(env_id = %env_id, disk = %disk.display(), "Created qcow2 disk");
        Ok(disk)
    }
}

/// Sparse raw image file, for container and host environments that have no
/// long-running VM process.
#[derive(Debug, Clone, Default)]
pub struct ImageFileBackend;

#[async_trait]
impl ProvisioningBackend for ImageFileBackend {
    fn name(&self) -> &'static str {
        "image-file"
    }

    async fn create_disk(
        &self,
        env_id: &str,
        storage_dir: &Path,
        size_mb: u64,
    ) -> Result<PathBuf, EnvironmentError> {
        let disk = storage_dir.join("disk.img");
        let provision_err = |e: std::io::Error| EnvironmentError::Provision {
            env_id: env_id.to_string(),
            reason: format!("Failed to create {}: {}", disk.display(), e),
        };

        let file = tokio::fs::File::create(&disk).await.map_err(provision_err)?;
        file.set_len(size_mb * 1024 * 1024)
            .await
            .map_err(provision_err)?;

        debug!(env_id = %env_id, disk = %disk.display(), "Created sparse disk image");
        Ok(disk)
    }
}
