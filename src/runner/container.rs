//! Docker container backend.
//!
//! Each test gets a fresh container with the environment's workspace bind
//! mounted at `/workspace`. Anything the script leaves under `/artifacts`
//! is copied into the environment's trace directory once the container
//! exits.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::environment::{Environment, HardwareProfile};
use crate::error::RunnerError;
use crate::execution::{limits_for_test_type, Container, ContainerConfig, DockerClient};
use crate::model::{ExecutionResult, TestCase, TestType};

use super::{script_env, BackendKind, Runner};

/// Path inside the container where scripts drop artifacts.
const ARTIFACTS_PATH: &str = "/artifacts";
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Runs tests in short-lived Docker containers.
pub struct ContainerRunner {
    client: DockerClient,
    image: String,
    env_id: String,
    workspace: PathBuf,
    traces: PathBuf,
    /// Container currently executing, if any.
    current: Mutex<Option<String>>,
}

impl ContainerRunner {
    pub fn new(client: DockerClient, image: impl Into<String>, environment: Environment) -> Self {
        Self {
            client,
            image: image.into(),
            workspace: environment.workspace_dir(),
            traces: environment.traces_dir(),
            env_id: environment.id,
            current: Mutex::new(None),
        }
    }

    fn container_config(&self, test: &TestCase) -> ContainerConfig {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "kforge-{}-{}-{}",
            sanitize(&self.env_id),
            sanitize(&test.id),
            &short[..8]
        );

        let env = script_env(test, &self.env_id)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        ContainerConfig::new(name, &self.image)
            .with_limits(limits_for_test_type(test.test_type))
            .with_cmd(vec!["sh".to_string(), "-c".to_string(), test.script.clone()])
            .with_env(env)
            .with_working_dir(CONTAINER_WORKSPACE)
            .with_volumes(vec![format!(
                "{}:{}",
                self.workspace.display(),
                CONTAINER_WORKSPACE
            )])
            .with_label("kforge.env", &self.env_id)
            .with_label("kforge.test", &test.id)
    }

    fn set_current(&self, id: Option<String>) {
        *self.current.lock().expect("container slot lock poisoned") = id;
    }
}

/// Docker container names allow `[a-zA-Z0-9_.-]`.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
impl Runner for ContainerRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(
        &self,
        test: &TestCase,
        timeout: Duration,
    ) -> Result<ExecutionResult, RunnerError> {
        tokio::fs::create_dir_all(&self.workspace).await?;
        let start = Instant::now();

        let mut container = Container::create(&self.client, self.container_config(test)).await?;
        self.set_current(Some(container.id().to_string()));

        if let Err(e) = container.start(&self.client).await {
            if let Err(cleanup_err) = container.cleanup(&self.client).await {
                warn!(container = %container.id(), error = %cleanup_err, "Cleanup after failed start");
            }
            self.set_current(None);
            return Err(e.into());
        }
        debug!(env_id = %self.env_id, test_id = %test.id, container = %container.id(), "Container started");

        let waited = tokio::time::timeout(timeout, container.wait(&self.client)).await;
        let (exit_code, timed_out) = match waited {
            Ok(Ok(code)) => (Some(code as i32), false),
            Ok(Err(e)) => {
                warn!(container = %container.id(), error = %e, "Wait failed");
                if let Err(cleanup_err) = container.cleanup(&self.client).await {
                    warn!(container = %container.id(), error = %cleanup_err, "Cleanup after failed wait");
                }
                self.set_current(None);
                return Err(e.into());
            }
            Err(_) => (None, true),
        };

        let logs = match container.logs(&self.client).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(container = %container.id(), error = %e, "Failed to read container logs");
                Default::default()
            }
        };

        if !timed_out {
            let dest = self.traces.join(&test.id);
            match container.copy_out(&self.client, ARTIFACTS_PATH, &dest).await {
                Ok(bytes) => debug!(test_id = %test.id, bytes, "Copied container artifacts"),
                // Most scripts never create /artifacts.
                Err(e) => debug!(test_id = %test.id, error = %e, "No container artifacts"),
            }
        }

        let cleanup = if timed_out {
            info!(test_id = %test.id, container = %container.id(), "Container timed out");
            container.mark_timeout(&self.client).await
        } else {
            container.cleanup(&self.client).await
        };
        if let Err(e) = cleanup {
            warn!(container = %container.id(), error = %e, "Failed to remove container");
        }
        self.set_current(None);

        Ok(ExecutionResult {
            exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
            execution_time: start.elapsed(),
            timed_out,
        })
    }

    async fn cleanup(&self) -> Result<(), RunnerError> {
        let current = self
            .current
            .lock()
            .expect("container slot lock poisoned")
            .take();
        if let Some(id) = current {
            self.client.remove_container(&id, true).await?;
        }
        Ok(())
    }

    fn supports_test_type(&self, _test_type: TestType) -> bool {
        true
    }

    fn supports_hardware(&self, profile: &HardwareProfile) -> bool {
        profile.is_virtual
    }
}
