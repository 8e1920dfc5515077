//! Environment lifecycle management.
//!
//! The manager owns the registry of live environments and their private
//! directory trees. Every public operation takes the registry lock only for
//! in-memory bookkeeping and never across an `.await`; callers receive
//! cloned snapshots, never references into the registry.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::OrchestratorConfig;
use crate::error::EnvironmentError;
use crate::metrics::MetricsCollector;
use crate::model::ArtifactBundle;
use crate::process::ProcessRegistry;

use super::backend::{ImageFileBackend, ProvisioningBackend, QemuBackend};
use super::types::{
    same_arch, Emulator, Environment, EnvironmentConfig, EnvironmentStatus, HealthReport,
    KernelImage, CORES_DIR, LOGS_DIR, TRACES_DIR, WORKSPACE_DIR,
};

/// Number of provisioning attempts, each with a fresh environment id.
const PROVISION_ATTEMPTS: usize = 2;

/// File name of a deployed kernel inside the environment tree.
const KERNEL_FILE: &str = "kernel.img";

/// Owns the lifecycle of ephemeral test environments.
pub struct EnvironmentManager {
    storage_root: PathBuf,
    default_disk_size_mb: u64,
    min_free_disk_mb: u64,
    environments: Mutex<HashMap<String, Environment>>,
    backends: HashMap<Emulator, Arc<dyn ProvisioningBackend>>,
    processes: ProcessRegistry,
    metrics: MetricsCollector,
}

impl EnvironmentManager {
    /// Creates a manager storing environments under `storage_root`, with
    /// the stock provisioning backends.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let mut backends: HashMap<Emulator, Arc<dyn ProvisioningBackend>> = HashMap::new();
        backends.insert(Emulator::Qemu, Arc::new(QemuBackend::default()));
        backends.insert(Emulator::Docker, Arc::new(ImageFileBackend));
        backends.insert(Emulator::Host, Arc::new(ImageFileBackend));

        Self {
            storage_root: storage_root.into(),
            default_disk_size_mb: 2048,
            min_free_disk_mb: 512,
            environments: Mutex::new(HashMap::new()),
            backends,
            processes: ProcessRegistry::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a manager from the orchestrator configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(&config.storage_root)
            .with_disk_size_mb(config.disk_size_mb)
            .with_min_free_disk_mb(config.min_free_disk_mb)
    }

    /// Registers (or replaces) the provisioning backend for `emulator`.
    pub fn with_backend(
        mut self,
        emulator: Emulator,
        backend: Arc<dyn ProvisioningBackend>,
    ) -> Self {
        self.backends.insert(emulator, backend);
        self
    }

    pub fn with_disk_size_mb(mut self, size: u64) -> Self {
        self.default_disk_size_mb = size;
        self
    }

    pub fn with_min_free_disk_mb(mut self, size: u64) -> Self {
        self.min_free_disk_mb = size;
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Process groups of running backends, keyed by environment id.
    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    /// Provisions a new virtual environment.
    ///
    /// A failed attempt is cleaned up and retried once with a fresh id. If
    /// the retry fails too, that environment stays registered in `Error`
    /// state and the provisioning error is returned.
    ///
    /// # Errors
    ///
    /// - `EnvironmentError::Config` if the profile is not virtual or has no
    ///   registered backend; never retried.
    /// - `EnvironmentError::Provision` if the backend fails twice.
    pub async fn provision(
        &self,
        config: &EnvironmentConfig,
    ) -> Result<Environment, EnvironmentError> {
        if !config.is_virtual() {
            return Err(EnvironmentError::Config(
                "only virtual environments can be provisioned".to_string(),
            ));
        }
        let emulator = config.hardware.emulator.ok_or_else(|| {
            EnvironmentError::Config("virtual hardware profile has no emulator".to_string())
        })?;
        let backend = self.backends.get(&emulator).cloned().ok_or_else(|| {
            EnvironmentError::Config(format!(
                "no provisioning backend registered for emulator '{}'",
                emulator
            ))
        })?;

        let mut attempt = 1;
        loop {
            let env_id = format!("env-{}", Uuid::new_v4());
            match self.provision_once(&env_id, config, backend.as_ref()).await {
                Ok(env) => {
                    info!(
                        env_id = %env.id,
                        arch = %env.hardware.architecture,
                        backend = backend.name(),
                        "Provisioned environment"
                    );
                    self.update_metrics();
                    return Ok(env);
                }
                Err(e) if attempt < PROVISION_ATTEMPTS => {
                    warn!(env_id = %env_id, error = %e, "Provisioning failed, retrying with a new id");
                    if let Err(cleanup_err) = self.cleanup(&env_id).await {
                        warn!(env_id = %env_id, error = %cleanup_err, "Failed to clean up failed environment");
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(env_id = %env_id, error = %e, "Provisioning failed");
                    self.update_metrics();
                    return Err(e);
                }
            }
        }
    }

    async fn provision_once(
        &self,
        env_id: &str,
        config: &EnvironmentConfig,
        backend: &dyn ProvisioningBackend,
    ) -> Result<Environment, EnvironmentError> {
        let now = Utc::now();
        let storage_dir = self.storage_root.join(env_id);
        let mut metadata = config.labels.clone();
        metadata.insert("provisioner".to_string(), backend.name().to_string());

        let env = Environment {
            id: env_id.to_string(),
            hardware: config.hardware.clone(),
            status: EnvironmentStatus::Provisioning,
            created_at: now,
            last_used: now,
            kernel_version: None,
            storage_dir: storage_dir.clone(),
            disk_image: None,
            kernel_image: None,
            metadata,
        };
        self.lock().insert(env_id.to_string(), env);

        let result = async {
            for sub in [LOGS_DIR, CORES_DIR, TRACES_DIR, WORKSPACE_DIR] {
                tokio::fs::create_dir_all(storage_dir.join(sub))
                    .await
                    .map_err(|e| EnvironmentError::Provision {
                        env_id: env_id.to_string(),
                        reason: format!("Failed to create storage: {}", e),
                    })?;
            }
            let size = config.disk_size_mb.unwrap_or(self.default_disk_size_mb);
            backend.create_disk(env_id, &storage_dir, size).await
        }
        .await;

        let mut envs = self.lock();
        let Some(env) = envs.get_mut(env_id) else {
            return Err(EnvironmentError::NotFound(env_id.to_string()));
        };
        match result {
            Ok(disk) => {
                env.disk_image = Some(disk);
                env.status = EnvironmentStatus::Idle;
                Ok(env.clone())
            }
            Err(e) => {
                env.status = EnvironmentStatus::Error;
                env.metadata.insert("error".to_string(), e.to_string());
                Err(e)
            }
        }
    }

    /// Deploys a kernel image into an environment.
    ///
    /// # Errors
    ///
    /// - `EnvironmentError::InvalidState` unless the environment is idle or busy.
    /// - `EnvironmentError::ArchMismatch` if the image targets another architecture.
    /// - `EnvironmentError::NotFound` if the environment or image path is missing.
    pub async fn deploy(
        &self,
        env_id: &str,
        image: &KernelImage,
    ) -> Result<Environment, EnvironmentError> {
        let storage_dir = {
            let envs = self.lock();
            let env = envs
                .get(env_id)
                .ok_or_else(|| EnvironmentError::NotFound(format!("environment {}", env_id)))?;
            if !matches!(
                env.status,
                EnvironmentStatus::Idle | EnvironmentStatus::Busy
            ) {
                return Err(EnvironmentError::InvalidState {
                    env_id: env_id.to_string(),
                    status: env.status.to_string(),
                    expected: "idle or busy".to_string(),
                });
            }
            if !same_arch(&image.architecture, &env.hardware.architecture) {
                return Err(EnvironmentError::ArchMismatch {
                    image: image.architecture.clone(),
                    environment: env.hardware.architecture.clone(),
                });
            }
            env.storage_dir.clone()
        };

        if !tokio::fs::try_exists(&image.path).await.unwrap_or(false) {
            return Err(EnvironmentError::NotFound(format!(
                "kernel image {}",
                image.path.display()
            )));
        }

        let target = storage_dir.join(KERNEL_FILE);
        tokio::fs::copy(&image.path, &target).await?;

        let mut envs = self.lock();
        let env = envs
            .get_mut(env_id)
            .ok_or_else(|| EnvironmentError::NotFound(format!("environment {}", env_id)))?;
        env.kernel_version = Some(image.version.clone());
        env.kernel_image = Some(target);
        env.metadata.insert(
            "kernel_source".to_string(),
            image.path.display().to_string(),
        );
        env.metadata
            .insert("deployed_at".to_string(), Utc::now().to_rfc3339());
        env.last_used = Utc::now();

        info!(env_id = %env_id, version = %image.version, "Deployed kernel");
        Ok(env.clone())
    }

    /// Collects logs, core dumps and traces from an environment.
    ///
    /// Best-effort: a missing environment or unreadable directory yields a
    /// partial (possibly empty) bundle, never an error.
    pub fn capture_artifacts(&self, env_id: &str) -> ArtifactBundle {
        let Some(env) = self.get(env_id) else {
            warn!(env_id = %env_id, "Cannot capture artifacts: environment not found");
            let mut bundle = ArtifactBundle::default();
            bundle
                .metadata
                .insert("error".to_string(), "environment not found".to_string());
            return bundle;
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("environment_id".to_string(), env.id.clone());
        metadata.insert("captured_at".to_string(), Utc::now().to_rfc3339());
        if let Some(version) = &env.kernel_version {
            metadata.insert("kernel_version".to_string(), version.clone());
        }

        ArtifactBundle {
            logs: scan_dir(&env.logs_dir()),
            core_dumps: scan_dir(&env.cores_dir()),
            traces: scan_dir(&env.traces_dir()),
            metadata,
        }
    }

    /// Read-only health check.
    pub fn check_health(&self, env_id: &str) -> Result<HealthReport, EnvironmentError> {
        let env = self
            .get(env_id)
            .ok_or_else(|| EnvironmentError::NotFound(format!("environment {}", env_id)))?;

        let mut issues = Vec::new();
        let disk_available_bytes = available_disk_bytes(&env.storage_dir);
        let disk_space_low = match disk_available_bytes {
            Some(bytes) => bytes < self.min_free_disk_mb.saturating_mul(1024 * 1024),
            None => {
                issues.push("storage directory is not accessible".to_string());
                false
            }
        };
        if disk_space_low {
            issues.push(format!(
                "less than {} MB free on storage volume",
                self.min_free_disk_mb
            ));
        }
        let in_error_state = env.status == EnvironmentStatus::Error;
        if in_error_state {
            issues.push("environment is in error state".to_string());
        }

        Ok(HealthReport {
            environment_id: env.id.clone(),
            status: env.status,
            healthy: issues.is_empty(),
            disk_available_bytes,
            disk_space_low,
            in_error_state,
            uptime_seconds: (Utc::now() - env.created_at).num_seconds(),
            issues,
        })
    }

    /// Destroys an environment.
    ///
    /// Kills any running backend process group, deletes the private
    /// directory tree and drops the registry entry. Returns `Ok(false)` when
    /// the environment was already gone.
    pub async fn cleanup(&self, env_id: &str) -> Result<bool, EnvironmentError> {
        let Some(env) = self.lock().remove(env_id) else {
            debug!(env_id = %env_id, "Cleanup of unknown environment ignored");
            return Ok(false);
        };
        self.destroy(env).await?;
        Ok(true)
    }

    /// Destroys an environment only if it is still idle and unused for at
    /// least `max_age` at `now`.
    ///
    /// The check and the registry removal happen under one lock, so an
    /// environment claimed by [`mark_busy`](Self::mark_busy) after a stale
    /// scan is never torn down. Returns `Ok(false)` when the environment is
    /// gone, busy or recently used.
    pub async fn cleanup_if_idle(
        &self,
        env_id: &str,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<bool, EnvironmentError> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let removed = {
            let mut envs = self.lock();
            match envs.get(env_id) {
                Some(env) if env.status == EnvironmentStatus::Idle && now - env.last_used >= max_age => {
                    envs.remove(env_id)
                }
                _ => None,
            }
        };
        let Some(env) = removed else {
            debug!(env_id = %env_id, "Environment no longer reclaimable, skipped");
            return Ok(false);
        };
        self.destroy(env).await?;
        Ok(true)
    }

    /// Reclaims every idle environment unused for at least `max_age`.
    pub async fn cleanup_idle(&self, max_age: Duration) -> Result<usize, EnvironmentError> {
        self.cleanup_idle_at(Utc::now(), max_age).await
    }

    /// [`cleanup_idle`](Self::cleanup_idle) evaluated at a given instant.
    pub async fn cleanup_idle_at(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<usize, EnvironmentError> {
        let threshold = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let stale: Vec<String> = self
            .lock()
            .values()
            .filter(|env| env.status == EnvironmentStatus::Idle && now - env.last_used >= threshold)
            .map(|env| env.id.clone())
            .collect();

        let mut count = 0;
        for env_id in stale {
            if self.cleanup_if_idle(&env_id, now, max_age).await? {
                count += 1;
            }
        }
        if count > 0 {
            info!(count = count, "Reclaimed idle environments");
        }
        Ok(count)
    }

    /// Tears down an environment already removed from the registry.
    async fn destroy(&self, env: Environment) -> Result<(), EnvironmentError> {
        if self.processes.kill(&env.id) {
            debug!(env_id = %env.id, "Killed running backend process group");
        }

        match tokio::fs::remove_dir_all(&env.storage_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.update_metrics();
                return Err(e.into());
            }
        }

        info!(env_id = %env.id, "Cleaned up environment");
        self.update_metrics();
        Ok(())
    }

    /// Deletes environment directories under the storage root that no live
    /// environment owns and that were last modified more than `max_age` ago.
    ///
    /// Used to recover storage left behind by a previous process.
    pub async fn sweep_orphans(&self, max_age: Duration) -> Result<usize, EnvironmentError> {
        let mut entries = match tokio::fs::read_dir(&self.storage_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("env-") || self.get(&name).is_some() {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!(env_id = %name, "Removed orphaned environment storage");
                    count += 1;
                }
                Err(e) => warn!(env_id = %name, error = %e, "Failed to remove orphaned storage"),
            }
        }
        Ok(count)
    }

    /// Atomically moves an idle environment to busy and returns a snapshot.
    pub fn mark_busy(&self, env_id: &str) -> Result<Environment, EnvironmentError> {
        let mut envs = self.lock();
        let env = envs
            .get_mut(env_id)
            .ok_or_else(|| EnvironmentError::NotFound(format!("environment {}", env_id)))?;
        if env.status != EnvironmentStatus::Idle {
            return Err(EnvironmentError::InvalidState {
                env_id: env_id.to_string(),
                status: env.status.to_string(),
                expected: EnvironmentStatus::Idle.to_string(),
            });
        }
        env.status = EnvironmentStatus::Busy;
        env.last_used = Utc::now();
        Ok(env.clone())
    }

    /// Returns a busy environment to idle and bumps `last_used`.
    ///
    /// Returns false if the environment is gone or was not busy.
    pub fn mark_idle(&self, env_id: &str) -> bool {
        let mut envs = self.lock();
        match envs.get_mut(env_id) {
            Some(env) if env.status == EnvironmentStatus::Busy => {
                env.status = EnvironmentStatus::Idle;
                env.last_used = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Moves an environment to error state.
    pub fn mark_error(&self, env_id: &str, reason: &str) -> bool {
        let mut envs = self.lock();
        match envs.get_mut(env_id) {
            Some(env) => {
                warn!(env_id = %env_id, reason = %reason, "Environment entered error state");
                env.status = EnvironmentStatus::Error;
                env.metadata.insert("error".to_string(), reason.to_string());
                true
            }
            None => false,
        }
    }

    /// Snapshot of one environment.
    pub fn get(&self, env_id: &str) -> Option<Environment> {
        self.lock().get(env_id).cloned()
    }

    /// Snapshot of every environment, oldest first.
    pub fn list(&self) -> Vec<Environment> {
        let mut envs: Vec<Environment> = self.lock().values().cloned().collect();
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        envs
    }

    /// Snapshot of idle environments, oldest first.
    pub fn list_idle(&self) -> Vec<Environment> {
        self.list().into_iter().filter(|e| e.is_idle()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update_metrics(&self) {
        self.metrics.update_environments(self.len());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Environment>> {
        self.environments
            .lock()
            .expect("environment registry lock poisoned")
    }
}

/// Sorted list of regular files under `dir`; empty if it cannot be read.
fn scan_dir(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Skipping unreadable artifact entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

#[cfg(unix)]
fn available_disk_bytes(path: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    #[allow(clippy::unnecessary_cast)]
    let bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    Some(bytes)
}

#[cfg(not(unix))]
fn available_disk_bytes(path: &Path) -> Option<u64> {
    path.exists().then_some(u64::MAX)
}
