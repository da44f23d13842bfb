//! uxtest - scenario execution and evaluation engine for VS Code UX tests
//!
//! Validates scenario files, provisions isolated editor instances, executes
//! steps through an automation driver while capturing artifacts, and judges
//! each run. Runs can be compared across editor versions and re-triggered by
//! file changes.

pub mod capture;
pub mod cli;
pub mod commands;
pub mod common;
pub mod compare;
pub mod driver;
pub mod judge;
pub mod orchestrator;
pub mod provision;
pub mod scenario;
pub mod store;
pub mod watch;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use orchestrator::{Orchestrator, RunOptions, RunRecord, RunState};
pub use scenario::{ScenarioDefinition, Validator};
