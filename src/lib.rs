//! kernel-forge: Kernel test orchestration.
//!
//! This library provisions ephemeral test environments, selects an execution
//! backend per test, runs tests under timeouts with crash detection, and
//! reclaims idle resources.

// Core modules
pub mod cli;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod model;
pub mod process;
pub mod resource;
pub mod runner;
pub mod service;

// Re-export commonly used error types
pub use error::{DockerError, EngineError, EnvironmentError, ResourceError, RunnerError};
