//! Grader capability and the request it is given

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::Decision;
use crate::orchestrator::RunRecord;
use crate::scenario::ExpectedOutcome;

/// Failure of a single grader invocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraderError {
    /// The backend could not be reached or is temporarily unavailable
    #[error("grader unreachable: {0}")]
    Unreachable(String),

    /// The backend answered but refused the request
    #[error("grader rejected the request: {0}")]
    Rejected(String),

    /// The backend answered but no decision could be read from it
    #[error("malformed grader response: {0}")]
    Malformed(String),
}

/// One line of the step transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub index: usize,
    pub summary: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What the grader sees of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GradeRequest {
    pub scenario_id: String,
    pub expected_outcome: String,
    pub transcript: Vec<TranscriptLine>,
    pub final_checks: Vec<String>,
    /// Artifact paths, for graders that can open them
    pub artifacts: Vec<String>,
}

impl GradeRequest {
    pub fn from_record(record: &RunRecord, expected: &ExpectedOutcome) -> Self {
        let transcript = record
            .steps
            .iter()
            .map(|step| TranscriptLine {
                index: step.index,
                summary: step.summary.clone(),
                status: step.status.as_str().to_string(),
                detail: step.error.clone().or_else(|| {
                    step.assertion.as_ref().and_then(|a| {
                        a.observed
                            .as_ref()
                            .and_then(|o| o.text.clone())
                            .map(|text| format!("observed text: {}", text))
                    })
                }),
            })
            .collect();

        let final_checks = record
            .final_checks
            .iter()
            .map(|c| format!("{}: {}", c.target, if c.passed { "ok" } else { "failed" }))
            .collect();

        Self {
            scenario_id: record.scenario_id.clone(),
            expected_outcome: expected.description.clone(),
            transcript,
            final_checks,
            artifacts: record
                .artifacts
                .iter()
                .map(|a| a.path.display().to_string())
                .collect(),
        }
    }

    /// Plain-text rendering used as the grader prompt
    pub fn render(&self) -> String {
        let mut out = format!(
            "Scenario: {}\nExpected outcome: {}\n\nTranscript:\n",
            self.scenario_id, self.expected_outcome
        );
        for line in &self.transcript {
            out.push_str(&format!("  [{}] {} -> {}", line.index, line.summary, line.status));
            if let Some(detail) = &line.detail {
                out.push_str(&format!(" ({})", detail));
            }
            out.push('\n');
        }
        if !self.final_checks.is_empty() {
            out.push_str("\nFinal checks:\n");
            for check in &self.final_checks {
                out.push_str(&format!("  {}\n", check));
            }
        }
        if !self.artifacts.is_empty() {
            out.push_str("\nArtifacts:\n");
            for artifact in &self.artifacts {
                out.push_str(&format!("  {}\n", artifact));
            }
        }
        out
    }
}

/// Answer of one grader invocation
#[derive(Debug, Clone, PartialEq)]
pub struct GradeResponse {
    pub decision: Decision,
    pub confidence: f64,
    pub rationale: String,
}

/// Language-model grader reached over request/response
#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, request: &GradeRequest) -> Result<GradeResponse, GraderError>;
}
