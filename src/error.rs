//! Error types for kernel-forge operations.
//!
//! Defines error types for each orchestration subsystem:
//! - Environment provisioning, deployment and cleanup
//! - Runner selection and backend execution
//! - Docker container management
//! - Execution engine preconditions
//! - Resource tracking and reclamation

use thiserror::Error;

/// Errors that can occur while managing test environments.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Invalid environment configuration: {0}")]
    Config(String),

    #[error("Provisioning failed for environment '{env_id}': {reason}")]
    Provision { env_id: String, reason: String },

    #[error("Image architecture '{image}' does not match environment architecture '{environment}'")]
    ArchMismatch { image: String, environment: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Environment '{env_id}' is {status}, expected {expected}")]
    InvalidState {
        env_id: String,
        status: String,
        expected: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while selecting or driving an execution backend.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("No runner registered for backend '{0}'")]
    BackendUnavailable(String),

    #[error("Runner setup failed: {0}")]
    Setup(String),

    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Failed to pull image: {0}")]
    PullFailed(String),

    #[error("Failed to copy files from container: {0}")]
    CopyFailed(String),

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the execution engine before a test can run.
///
/// Anything that goes wrong once a test is running is recorded in the
/// test result instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("Environment '{env_id}' is {status}, expected idle")]
    EnvironmentNotIdle { env_id: String, status: String },

    #[error("Parallel execution handle '{0}' not found")]
    HandleNotFound(String),

    #[error("No environments supplied for parallel execution")]
    NoEnvironments,

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),
}

/// Errors that can occur in the resource manager.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Resource '{0}' not registered")]
    NotFound(String),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),
}
