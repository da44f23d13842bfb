//! Run records and the run state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::Artifact;
use crate::driver::{DriverError, ElementSnapshot};
use crate::judge::{Decision, EvaluationVerdict};
use crate::provision::ResolvedEnvironment;
use crate::scenario::{AssertionSpec, ScenarioDefinition, StepKind, VersionSpec};

/// Why a step did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepExecutionError {
    #[error("{0}")]
    Driver(#[from] DriverError),

    #[error("Gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: DriverError },

    #[error("Timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Step cannot be interpreted: {0}")]
    InvalidStep(String),
}

impl StepExecutionError {
    /// Whether the failure says more about the tooling than the editor
    pub fn is_infrastructure(&self) -> bool {
        match self {
            StepExecutionError::Driver(e) | StepExecutionError::RetriesExhausted { last: e, .. } => {
                e.is_infrastructure()
            }
            _ => false,
        }
    }
}

/// Misuse of a run record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Illegal run transition {from:?} -> {to:?}")]
    IllegalTransition { from: RunState, to: RunState },

    #[error("Run is already {0:?} and can no longer change")]
    Finalized(RunState),

    #[error("No step with index {0}")]
    NoSuchStep(usize),
}

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Provisioning,
    Running,
    Evaluating,
    Finalizing,
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Passed | RunState::Failed | RunState::Errored | RunState::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Provisioning => "provisioning",
            RunState::Running => "running",
            RunState::Evaluating => "evaluating",
            RunState::Finalizing => "finalizing",
            RunState::Passed => "passed",
            RunState::Failed => "failed",
            RunState::Errored => "errored",
            RunState::Skipped => "skipped",
        }
    }

    /// Whether `self -> to` is a legal transition
    ///
    /// Every run passes through `Finalizing` before its terminal state;
    /// provisioning and running may jump there directly when the run is cut
    /// short.
    pub fn can_advance_to(&self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Provisioning, Running)
                | (Provisioning, Finalizing)
                | (Running, Evaluating)
                | (Running, Finalizing)
                | (Evaluating, Finalizing)
                | (Finalizing, Passed)
                | (Finalizing, Failed)
                | (Finalizing, Errored)
                | (Finalizing, Skipped)
        )
    }
}

/// Step lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
    /// Never executed: the run was aborted, timed out or cancelled first
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Executing => "executing",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::TimedOut => "timed_out",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::TimedOut)
    }
}

/// Result of checking an element against expectations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub passed: bool,
    pub expected: AssertionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<ElementSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<String>,
}

impl AssertionResult {
    /// Compare an observed element with the expectation
    pub fn check(expected: &AssertionSpec, observed: ElementSnapshot) -> Self {
        let mut mismatches = Vec::new();
        let text = observed.text.as_deref().unwrap_or("");

        if let Some(visible) = expected.visible {
            let actual = observed.count > 0 && observed.visible;
            if actual != visible {
                mismatches.push(format!("expected visible={}, was {}", visible, actual));
            }
        }
        if let Some(want) = &expected.text_equals {
            if observed.text.as_deref() != Some(want.as_str()) {
                mismatches.push(format!("expected text '{}', was '{}'", want, text));
            }
        }
        if let Some(want) = &expected.text_contains {
            if !text.contains(want.as_str()) {
                mismatches.push(format!("expected text containing '{}', was '{}'", want, text));
            }
        }
        if let Some(want) = expected.count {
            if observed.count != want {
                mismatches.push(format!("expected {} match(es), found {}", want, observed.count));
            }
        }

        Self {
            passed: mismatches.is_empty(),
            expected: expected.clone(),
            observed: Some(observed),
            mismatches,
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub kind: StepKind,
    pub summary: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<AssertionResult>,
}

impl StepOutcome {
    /// Whether the step's assertion was checked and failed
    pub fn assertion_failed(&self) -> bool {
        self.assertion.as_ref().map(|a| !a.passed).unwrap_or(false)
    }
}

/// Final-state check from the expected outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalCheck {
    pub target: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How the run executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single pass under a scenario deadline
    Direct,
    /// Checkpointed after every step
    Orchestrated,
}

/// Everything known about one run of one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub scenario_id: String,
    /// Version the run was asked for, e.g. `insiders@>=1.95`
    pub requested_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<ResolvedEnvironment>,
    pub mode: ExecutionMode,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub final_checks: Vec<FinalCheck>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Absorbed problems, such as capture failures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<EvaluationVerdict>,
    /// Why the run ended errored or skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunRecord {
    /// New record in `Provisioning`, with a pending outcome for every step
    pub fn new(
        run_id: impl Into<String>,
        scenario: &ScenarioDefinition,
        version: &VersionSpec,
        mode: ExecutionMode,
    ) -> Self {
        let steps = scenario
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepOutcome {
                index,
                kind: step.kind,
                summary: step.summary(),
                status: StepStatus::Pending,
                attempts: 0,
                blocking: step.blocking,
                started_at: None,
                ended_at: None,
                error: None,
                assertion: None,
            })
            .collect();

        Self {
            run_id: run_id.into(),
            scenario_id: scenario.id.clone(),
            requested_version: version.to_string(),
            environment: None,
            mode,
            state: RunState::Provisioning,
            started_at: Utc::now(),
            ended_at: None,
            steps,
            final_checks: Vec::new(),
            artifacts: Vec::new(),
            warnings: Vec::new(),
            verdict: None,
            reason: None,
        }
    }

    fn ensure_open(&self) -> Result<(), RecordError> {
        if self.state.is_terminal() {
            return Err(RecordError::Finalized(self.state));
        }
        Ok(())
    }

    /// Move to the next lifecycle state
    pub fn advance(&mut self, to: RunState) -> Result<(), RecordError> {
        self.ensure_open()?;
        if !self.state.can_advance_to(to) {
            return Err(RecordError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn begin_step(&mut self, index: usize) -> Result<(), RecordError> {
        self.ensure_open()?;
        let step = self
            .steps
            .get_mut(index)
            .ok_or(RecordError::NoSuchStep(index))?;
        step.status = StepStatus::Executing;
        step.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn finish_step(
        &mut self,
        index: usize,
        status: StepStatus,
        attempts: u32,
        error: Option<String>,
        assertion: Option<AssertionResult>,
    ) -> Result<(), RecordError> {
        self.ensure_open()?;
        let step = self
            .steps
            .get_mut(index)
            .ok_or(RecordError::NoSuchStep(index))?;
        step.status = status;
        step.attempts = attempts;
        step.error = error;
        step.assertion = assertion;
        step.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Mark every step from `from` on that never ran as skipped
    pub fn skip_remaining(&mut self, from: usize, reason: &str) -> Result<(), RecordError> {
        self.ensure_open()?;
        for step in self.steps.iter_mut().skip(from) {
            if matches!(step.status, StepStatus::Pending | StepStatus::Executing) {
                step.status = StepStatus::Skipped;
                step.error = Some(reason.to_string());
            }
        }
        Ok(())
    }

    pub fn add_final_check(&mut self, check: FinalCheck) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.final_checks.push(check);
        Ok(())
    }

    pub fn add_artifacts(&mut self, artifacts: Vec<Artifact>) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.artifacts.extend(artifacts);
        Ok(())
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.warnings.push(warning.into());
        Ok(())
    }

    pub fn set_verdict(&mut self, verdict: EvaluationVerdict) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.verdict = Some(verdict);
        Ok(())
    }

    /// Terminal state implied by the verdict
    pub fn status_from_verdict(&self) -> RunState {
        match self.verdict.as_ref().map(|v| v.decision) {
            Some(Decision::Pass) => RunState::Passed,
            // An unproven pass is not a pass
            Some(Decision::Fail) | Some(Decision::Inconclusive) | None => RunState::Failed,
        }
    }

    /// Outcomes whose step did not succeed
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.status.is_failure())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}
