//! Core data model shared by every orchestration layer.
//!
//! Test definitions flow in as [`TestCase`]s, backends report raw
//! [`ExecutionResult`]s, and the engine turns those into classified
//! [`TestResult`]s carrying an [`ArtifactBundle`].

pub mod result;
pub mod test_case;

pub use result::{
    ArtifactBundle, EnvironmentRef, ExecutionResult, FailureInfo, TestOutcome, TestResult,
    TestStatus,
};
pub use test_case::{ExpectedOutcome, HardwareRequirements, TestCase, TestType};
