//! Docker API wrapper using the bollard crate.
//!
//! This module provides a high-level interface to the Docker operations the
//! container backend needs: create, start, wait, logs, copy-archive, remove.

use std::io::Cursor;
use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use crate::error::DockerError;
use crate::execution::resources::ExecutionLimits;

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique name for the container.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Option<Vec<String>>,
    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Resource limits for the container.
    pub limits: ExecutionLimits,
    /// Volume mounts (host:container format).
    pub volumes: Vec<String>,
    /// Labels attached to the container.
    pub labels: Vec<(String, String)>,
}

impl ContainerConfig {
    /// Creates a new container configuration with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            working_dir: None,
            limits: ExecutionLimits::default(),
            volumes: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Sets explicit resource limits.
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the command to run in the container.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Adds environment variables.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds volume mounts.
    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }
}

/// Status of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatusInfo {
    /// Container is created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container is paused.
    Paused,
    /// Container is restarting.
    Restarting,
    /// Container has exited.
    Exited { exit_code: i64 },
    /// Container is being removed.
    Removing,
    /// Container is dead.
    Dead,
    /// Unknown status.
    Unknown(String),
}

/// Split output of a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerLogs {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client for the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Creates a new container with the given configuration.
    ///
    /// # Returns
    ///
    /// The container ID on success.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
        let host_config = HostConfig {
            memory: Some(config.limits.memory_bytes()),
            cpu_period: Some(config.limits.cpu_period()),
            cpu_quota: Some(config.limits.cpu_quota()),
            pids_limit: Some(config.limits.max_processes as i64),
            network_mode: Some(config.limits.network_mode().to_string()),
            binds: if config.volumes.is_empty() {
                None
            } else {
                Some(config.volumes.clone())
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            working_dir: config.working_dir.clone(),
            labels: if config.labels.is_empty() {
                None
            } else {
                Some(config.labels.iter().cloned().collect())
            },
            host_config: Some(host_config),
            // No TTY so stdout and stderr stay separate in the logs.
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by ID.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Stops a container by ID.
    ///
    /// Sends SIGTERM and waits up to `grace_secs` before sending SIGKILL.
    pub async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError> {
        let options = StopContainerOptions { t: grace_secs };

        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to stop container: {e}")))?;

        Ok(())
    }

    /// Removes a container by ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Container ID
    /// * `force` - Force removal even if running
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to remove container: {e}")))?;

        Ok(())
    }

    /// Gets stdout and stderr of a container.
    pub async fn get_logs(&self, id: &str) -> Result<ContainerLogs, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = ContainerLogs::default();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(DockerError::RunFailed(format!("Error reading logs: {e}")));
                }
            }
        }

        Ok(output)
    }

    /// Copies `path` out of a container and unpacks it under `dest`.
    ///
    /// Returns the number of bytes in the received archive.
    pub async fn copy_from_container(
        &self,
        id: &str,
        path: &str,
        dest: &Path,
    ) -> Result<usize, DockerError> {
        let options = DownloadFromContainerOptions { path };
        let mut stream = self.docker.download_from_container(id, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| DockerError::CopyFailed(format!("Failed to read {path}: {e}")))?;
            archive.extend_from_slice(&chunk);
        }

        std::fs::create_dir_all(dest)?;
        tar::Archive::new(Cursor::new(&archive))
            .unpack(dest)
            .map_err(|e| DockerError::CopyFailed(format!("Failed to unpack {path}: {e}")))?;

        Ok(archive.len())
    }

    /// Gets the status of a container.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatusInfo, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::RunFailed(format!("Failed to inspect container: {e}"))
                }
            })?;

        let state = info
            .state
            .ok_or_else(|| DockerError::RunFailed("Container has no state".to_string()))?;

        let status = state.status.map(|s| s.to_string()).unwrap_or_default();

        match status.as_str() {
            "created" => Ok(ContainerStatusInfo::Created),
            "running" => Ok(ContainerStatusInfo::Running),
            "paused" => Ok(ContainerStatusInfo::Paused),
            "restarting" => Ok(ContainerStatusInfo::Restarting),
            "removing" => Ok(ContainerStatusInfo::Removing),
            "exited" => Ok(ContainerStatusInfo::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            }),
            "dead" => Ok(ContainerStatusInfo::Dead),
            other => Ok(ContainerStatusInfo::Unknown(other.to_string())),
        }
    }

    /// Pulls a Docker image from a registry.
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::PullFailed(format!("{image}: {e}")))?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Waits for a container to stop running.
    ///
    /// # Returns
    ///
    /// The exit code of the container.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        if let Some(result) = stream.next().await {
            match result {
                Ok(response) => return Ok(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    return Ok(code)
                }
                Err(e) => {
                    return Err(DockerError::RunFailed(format!(
                        "Error waiting for container: {e}"
                    )))
                }
            }
        }

        let status = self.container_status(id).await?;
        match status {
            ContainerStatusInfo::Exited { exit_code } => Ok(exit_code),
            _ => Err(DockerError::RunFailed(
                "Container did not exit normally".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::limits_for_test_type;
    use crate::model::TestType;

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("kforge-env-1-t1", "debian:bookworm-slim")
            .with_limits(limits_for_test_type(TestType::Performance))
            .with_cmd(vec!["sh".to_string(), "-c".to_string(), "true".to_string()])
            .with_env(vec!["KFORGE_TEST_ID=t1".to_string()])
            .with_working_dir("/workspace")
            .with_label("kforge.env", "env-1");

        assert_eq!(config.name, "kforge-env-1-t1");
        assert_eq!(config.limits.memory_mb, 4096);
        assert_eq!(config.cmd.unwrap().len(), 3);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.working_dir.unwrap(), "/workspace");
        assert_eq!(config.labels[0].0, "kforge.env");
    }

    #[test]
    fn test_container_status_info() {
        let running = ContainerStatusInfo::Running;
        let exited = ContainerStatusInfo::Exited { exit_code: 0 };
        let unknown = ContainerStatusInfo::Unknown("custom".to_string());

        assert_eq!(running, ContainerStatusInfo::Running);
        assert!(matches!(
            exited,
            ContainerStatusInfo::Exited { exit_code: 0 }
        ));
        assert!(matches!(unknown, ContainerStatusInfo::Unknown(_)));
    }
}
