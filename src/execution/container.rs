//! Lifecycle of a single test container.
//!
//! ```text
//! PENDING → RUNNING → EXITED(code) / TIMEOUT → REMOVED
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DockerError;
use crate::execution::docker_client::{
    ContainerConfig, ContainerLogs, ContainerStatusInfo, DockerClient,
};

/// Seconds Docker waits after SIGTERM before SIGKILL on stop.
const STOP_GRACE_SECS: i64 = 2;

/// Status of a managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Created but not started.
    Pending,
    /// Running the test script.
    Running,
    /// Exited on its own with this code.
    Exited(i64),
    /// Killed after exceeding its timeout.
    Timeout,
    /// Removed from the daemon.
    Removed,
    /// Docker reported something we cannot use.
    Failed(String),
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Pending => write!(f, "pending"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Exited(code) => write!(f, "exited({code})"),
            ContainerStatus::Timeout => write!(f, "timeout"),
            ContainerStatus::Removed => write!(f, "removed"),
            ContainerStatus::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

impl From<ContainerStatusInfo> for ContainerStatus {
    fn from(info: ContainerStatusInfo) -> Self {
        match info {
            ContainerStatusInfo::Created => ContainerStatus::Pending,
            ContainerStatusInfo::Running
            | ContainerStatusInfo::Paused
            | ContainerStatusInfo::Restarting => ContainerStatus::Running,
            ContainerStatusInfo::Exited { exit_code } => ContainerStatus::Exited(exit_code),
            ContainerStatusInfo::Removing => ContainerStatus::Removed,
            ContainerStatusInfo::Dead => ContainerStatus::Failed("container is dead".to_string()),
            ContainerStatusInfo::Unknown(s) => ContainerStatus::Failed(format!("unknown status: {s}")),
        }
    }
}

/// A Docker container created for one test run.
#[derive(Debug)]
pub struct Container {
    id: String,
    status: ContainerStatus,
    config: ContainerConfig,
    created_at: DateTime<Utc>,
}

impl Container {
    /// Creates the container, pulling the image first if it is missing.
    ///
    /// The container is created but not started.
    pub async fn create(client: &DockerClient, config: ContainerConfig) -> Result<Self, DockerError> {
        if !client.image_exists(&config.image).await {
            client.pull_image(&config.image).await?;
        }

        let id = client.create_container(&config).await?;

        Ok(Self {
            id,
            status: ContainerStatus::Pending,
            config,
            created_at: Utc::now(),
        })
    }

    /// Starts a pending container.
    pub async fn start(&mut self, client: &DockerClient) -> Result<(), DockerError> {
        if self.status != ContainerStatus::Pending {
            return Err(DockerError::RunFailed(format!(
                "Cannot start container in {} state",
                self.status
            )));
        }

        match client.start_container(&self.id).await {
            Ok(()) => {
                self.status = ContainerStatus::Running;
                Ok(())
            }
            Err(e) => {
                self.status = ContainerStatus::Failed(format!("start failed: {e}"));
                Err(e)
            }
        }
    }

    /// Waits for the container to exit and returns its exit code.
    pub async fn wait(&mut self, client: &DockerClient) -> Result<i64, DockerError> {
        let exit_code = client.wait_container(&self.id).await?;
        self.status = ContainerStatus::Exited(exit_code);
        Ok(exit_code)
    }

    /// Split stdout and stderr of the container.
    pub async fn logs(&self, client: &DockerClient) -> Result<ContainerLogs, DockerError> {
        client.get_logs(&self.id).await
    }

    /// Copies `path` out of the container into `dest`.
    pub async fn copy_out(
        &self,
        client: &DockerClient,
        path: &str,
        dest: &Path,
    ) -> Result<usize, DockerError> {
        client.copy_from_container(&self.id, path, dest).await
    }

    /// Refreshes the local status from the daemon.
    pub async fn sync_status(&mut self, client: &DockerClient) -> Result<(), DockerError> {
        self.status = client.container_status(&self.id).await?.into();
        Ok(())
    }

    /// Stops (if running) and force-removes the container.
    pub async fn cleanup(&mut self, client: &DockerClient) -> Result<(), DockerError> {
        if self.status == ContainerStatus::Removed {
            return Ok(());
        }

        if self.status == ContainerStatus::Running {
            if let Err(e) = client.stop_container(&self.id, STOP_GRACE_SECS).await {
                warn!(container = %self.id, error = %e, "Failed to stop container gracefully");
            }
        }

        client.remove_container(&self.id, true).await?;

        if !matches!(
            self.status,
            ContainerStatus::Exited(_) | ContainerStatus::Timeout | ContainerStatus::Failed(_)
        ) {
            self.status = ContainerStatus::Removed;
        }

        Ok(())
    }

    /// Marks the container as timed out and removes it.
    pub async fn mark_timeout(&mut self, client: &DockerClient) -> Result<(), DockerError> {
        // Still running from the daemon's point of view, so stop it first.
        self.status = ContainerStatus::Running;
        let result = self.cleanup(client).await;
        self.status = ContainerStatus::Timeout;
        result
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> &ContainerStatus {
        &self.status
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Checks if the container finished (exited, timed out or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ContainerStatus::Exited(_) | ContainerStatus::Failed(_) | ContainerStatus::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_display() {
        assert_eq!(ContainerStatus::Pending.to_string(), "pending");
        assert_eq!(ContainerStatus::Running.to_string(), "running");
        assert_eq!(ContainerStatus::Exited(3).to_string(), "exited(3)");
        assert_eq!(ContainerStatus::Timeout.to_string(), "timeout");
        assert_eq!(
            ContainerStatus::Failed("boom".to_string()).to_string(),
            "failed: boom"
        );
    }

    #[test]
    fn test_status_from_docker_info() {
        assert_eq!(
            ContainerStatus::from(ContainerStatusInfo::Exited { exit_code: 137 }),
            ContainerStatus::Exited(137)
        );
        assert_eq!(
            ContainerStatus::from(ContainerStatusInfo::Paused),
            ContainerStatus::Running
        );
        assert!(matches!(
            ContainerStatus::from(ContainerStatusInfo::Dead),
            ContainerStatus::Failed(_)
        ));
    }
}
