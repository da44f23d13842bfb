//! Error types for the UX test engine
//!
//! Error messages are meant to be actionable: they say what went wrong and,
//! where there is an obvious fix, how to get the run going again.

use std::io;
use thiserror::Error;

use crate::capture::ArtifactCaptureError;
use crate::compare::ComparisonError;
use crate::driver::DriverError;
use crate::judge::EvaluationError;
use crate::orchestrator::StepExecutionError;
use crate::provision::ProvisionError;
use crate::scenario::ValidationIssue;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for a run where every requested scenario passed
pub const EXIT_PASSED: i32 = 0;
/// Exit code when at least one scenario failed, was inconclusive or skipped
pub const EXIT_FAILED: i32 = 1;
/// Exit code for malformed scenarios
pub const EXIT_VALIDATION: i32 = 2;
/// Exit code for infrastructure, provisioning or evaluator problems
pub const EXIT_INFRASTRUCTURE: i32 = 3;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // === Scenario Errors ===
    #[error("Scenario '{source_name}' is invalid:\n{}", format_issues(.issues))]
    Validation {
        source_name: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("Scenario '{0}' not found. Use 'uxtest list' to see available scenarios")]
    ScenarioNotFound(String),

    #[error("Duplicate scenario id '{id}' in {first} and {second}")]
    DuplicateScenario {
        id: String,
        first: String,
        second: String,
    },

    // === Engine Errors ===
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),

    #[error(transparent)]
    ArtifactCapture(#[from] ArtifactCaptureError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Comparison(#[from] ComparisonError),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("Failed to write '{path}': {error}")]
    FileWrite { path: String, error: String },

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a file write error for a path
    pub fn file_write(path: &std::path::Path, error: impl std::fmt::Display) -> Self {
        Self::FileWrite {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Create a file read error for a path
    pub fn file_read(path: &std::path::Path, error: impl std::fmt::Display) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Process exit code this error maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation { .. }
            | Error::ScenarioNotFound(_)
            | Error::DuplicateScenario { .. } => EXIT_VALIDATION,
            _ => EXIT_INFRASTRUCTURE,
        }
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}
