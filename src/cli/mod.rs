//! Command-line interface for kernel-forge.
//!
//! Provides commands to run and inspect test plans, reclaim leftover
//! environment storage and export metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, PlanFile};
