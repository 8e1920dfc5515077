//! Docker execution layer used by the container backend.
//!
//! Wraps the bollard crate for container lifecycle management and resource
//! control.
//!
//! # Example
//!
//! ```ignore
//! use kernel_forge::execution::{limits_for_test_type, Container, ContainerConfig, DockerClient};
//! use kernel_forge::model::TestType;
//!
//! let client = DockerClient::new()?;
//! let config = ContainerConfig::new("kforge-env-1-t1", "debian:bookworm-slim")
//!     .with_limits(limits_for_test_type(TestType::Unit))
//!     .with_cmd(vec!["sh".into(), "-c".into(), "true".into()]);
//!
//! let mut container = Container::create(&client, config).await?;
//! container.start(&client).await?;
//! let code = container.wait(&client).await?;
//! container.cleanup(&client).await?;
//! ```

pub mod container;
pub mod docker_client;
pub mod resources;

pub use container::{Container, ContainerStatus};
pub use docker_client::{ContainerConfig, ContainerLogs, DockerClient};
pub use resources::{limits_for_test_type, ExecutionLimits};
