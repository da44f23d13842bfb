//! Evaluation judge
//!
//! Deterministic evidence is resolved first: a failed assertion, a failed
//! final check, a blocking step that did not succeed or a step that never
//! ran fails the run without consulting the grader. Otherwise the language-model grader is asked up to
//! `max_invocations` times and a decision is accepted once `quorum` votes
//! agree. Grader votes of "inconclusive" and malformed answers count as
//! invocations but not as votes.

mod grader;
mod http;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::common::config::JudgeConfig;
use crate::orchestrator::{RunRecord, StepStatus};
use crate::scenario::ExpectedOutcome;

pub use grader::{GradeRequest, GradeResponse, Grader, GraderError, TranscriptLine};
pub use http::{parse_decision, HttpGrader};

/// Judge failures, distinct from a judged fail
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Evaluation backend unreachable (after {invocations} invocation(s)): {message}")]
    Unreachable { message: String, invocations: u32 },

    #[error("Evaluation backend rejected the request (after {invocations} invocation(s)): {message}")]
    Rejected { message: String, invocations: u32 },
}

/// Decision of the judge or of one grader invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pass,
    Fail,
    Inconclusive,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pass => "pass",
            Decision::Fail => "fail",
            Decision::Inconclusive => "inconclusive",
        }
    }
}

/// Final verdict on a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub decision: Decision,
    /// In `[0, 1]`
    pub confidence: f64,
    pub rationale: String,
    /// Grader invocations consumed
    pub invocations: u32,
}

impl EvaluationVerdict {
    fn deterministic(decision: Decision, confidence: f64, rationale: String) -> Self {
        Self {
            decision,
            confidence: confidence.clamp(0.0, 1.0),
            rationale,
            invocations: 0,
        }
    }
}

/// Renders verdicts on completed runs
pub struct Judge {
    grader: Option<Arc<dyn Grader>>,
    max_invocations: u32,
    quorum: u32,
}

impl Judge {
    /// Judge backed by a language-model grader
    pub fn new(grader: Arc<dyn Grader>, config: &JudgeConfig) -> Self {
        Self {
            grader: Some(grader),
            max_invocations: config.max_invocations,
            quorum: config.quorum.max(1),
        }
    }

    /// Judge that only uses deterministic evidence
    pub fn deterministic() -> Self {
        Self {
            grader: None,
            max_invocations: 0,
            quorum: 1,
        }
    }

    /// Judge a run against its expected outcome
    #[tracing::instrument(skip_all, fields(scenario = %record.scenario_id, run_id = %record.run_id))]
    pub async fn evaluate(
        &self,
        record: &RunRecord,
        expected: &ExpectedOutcome,
    ) -> Result<EvaluationVerdict, EvaluationError> {
        if let Some(verdict) = short_circuit(record) {
            tracing::debug!(rationale = %verdict.rationale, "Deterministic fail");
            return Ok(verdict);
        }

        let grader = match &self.grader {
            Some(grader) if !expected.description.trim().is_empty() => grader,
            _ => return Ok(deterministic_pass(record)),
        };

        let request = GradeRequest::from_record(record, expected);
        let mut pass = Tally::default();
        let mut fail = Tally::default();
        let mut abstained = 0u32;
        let mut invocations = 0u32;

        while invocations < self.max_invocations {
            invocations += 1;
            match grader.grade(&request).await {
                Ok(response) => {
                    let tally = match response.decision {
                        Decision::Pass => &mut pass,
                        Decision::Fail => &mut fail,
                        Decision::Inconclusive => {
                            abstained += 1;
                            continue;
                        }
                    };
                    tally.add(&response);
                    tracing::debug!(invocations, decision = response.decision.as_str(), "Grader vote");

                    if tally.votes >= self.quorum {
                        return Ok(EvaluationVerdict {
                            decision: response.decision,
                            confidence: tally.mean_confidence(),
                            rationale: response.rationale,
                            invocations,
                        });
                    }
                }
                Err(GraderError::Malformed(message)) => {
                    tracing::warn!(invocations, "Unusable grader response: {}", message);
                    abstained += 1;
                }
                Err(GraderError::Unreachable(message)) => {
                    return Err(EvaluationError::Unreachable {
                        message,
                        invocations,
                    });
                }
                Err(GraderError::Rejected(message)) => {
                    return Err(EvaluationError::Rejected {
                        message,
                        invocations,
                    });
                }
            }
        }

        Ok(EvaluationVerdict {
            decision: Decision::Inconclusive,
            confidence: 0.0,
            rationale: format!(
                "No quorum of {} within {} invocation(s): {} pass, {} fail, {} without a decision",
                self.quorum, invocations, pass.votes, fail.votes, abstained
            ),
            invocations,
        })
    }
}

#[derive(Default)]
struct Tally {
    votes: u32,
    confidence: f64,
}

impl Tally {
    fn add(&mut self, response: &GradeResponse) {
        self.votes += 1;
        self.confidence += response.confidence.clamp(0.0, 1.0);
    }

    fn mean_confidence(&self) -> f64 {
        if self.votes == 0 {
            0.0
        } else {
            self.confidence / self.votes as f64
        }
    }
}

/// Fail on deterministic evidence, without consulting the grader
fn short_circuit(record: &RunRecord) -> Option<EvaluationVerdict> {
    if let Some(step) = record.steps.iter().find(|s| s.assertion_failed()) {
        let detail = step
            .assertion
            .as_ref()
            .map(|a| a.mismatches.join("; "))
            .unwrap_or_default();
        return Some(EvaluationVerdict::deterministic(
            Decision::Fail,
            1.0,
            format!("Assertion at step {} ({}) failed: {}", step.index, step.summary, detail),
        ));
    }

    if let Some(check) = record.final_checks.iter().find(|c| !c.passed) {
        let detail = check
            .error
            .clone()
            .or_else(|| check.result.as_ref().map(|r| r.mismatches.join("; ")))
            .unwrap_or_default();
        return Some(EvaluationVerdict::deterministic(
            Decision::Fail,
            1.0,
            format!("Final check on {} failed: {}", check.target, detail),
        ));
    }

    if let Some(step) = record
        .steps
        .iter()
        .find(|s| s.blocking && s.status != StepStatus::Succeeded)
    {
        return Some(EvaluationVerdict::deterministic(
            Decision::Fail,
            1.0,
            format!(
                "Step {} ({}) {}{}",
                step.index,
                step.summary,
                step.status.as_str(),
                step.error
                    .as_ref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ),
        ));
    }

    if let Some(step) = record
        .steps
        .iter()
        .find(|s| matches!(s.status, StepStatus::Skipped | StepStatus::Pending))
    {
        return Some(EvaluationVerdict::deterministic(
            Decision::Fail,
            1.0,
            format!(
                "Step {} ({}) never ran: {}",
                step.index,
                step.summary,
                step.error.as_deref().unwrap_or("skipped")
            ),
        ));
    }

    None
}

fn deterministic_pass(record: &RunRecord) -> EvaluationVerdict {
    let total = record.steps.len().max(1);
    let succeeded = record
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .count();
    let soft_failures = record.failed_steps().count();
    let rationale = if soft_failures == 0 {
        "All steps and checks succeeded; no language-model grading".to_string()
    } else {
        format!(
            "All blocking steps and checks succeeded, {} non-blocking step(s) did not; no language-model grading",
            soft_failures
        )
    };
    EvaluationVerdict::deterministic(Decision::Pass, succeeded as f64 / total as f64, rationale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{AssertionResult, ExecutionMode, RunState};
    use crate::scenario::{AssertionSpec, Validator};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const SCENARIO: &str = r#"
id: save-file
title: Save a file
description: Saving clears the dirty marker
tags: [editor]
priority: P1
owner: editor-team
environment:
  version: stable
steps:
  - kind: action
    target: { selector: ".monaco-editor textarea" }
    params: { action: type, text: "hello" }
  - kind: action
    target: { selector: ".tab.active" }
    params: { action: click }
    blocking: false
expectedOutcome:
  description: The tab no longer shows the dirty marker
"#;

    /// Grader replaying a fixed script of answers
    struct Scripted {
        answers: Mutex<Vec<Result<Decision, GraderError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<Decision, GraderError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Grader for Scripted {
        async fn grade(&self, _request: &GradeRequest) -> Result<GradeResponse, GraderError> {
            *self.calls.lock().unwrap() += 1;
            let next = self.answers.lock().unwrap().pop().expect("grader called too often");
            next.map(|decision| GradeResponse {
                decision,
                confidence: 0.8,
                rationale: format!("graded {}", decision.as_str()),
            })
        }
    }

    fn completed_record() -> (RunRecord, ExpectedOutcome) {
        let scenario = Validator::new(false).validate_str(SCENARIO).unwrap().scenario;
        let mut record = RunRecord::new(
            "run-1",
            &scenario,
            &scenario.environment.version,
            ExecutionMode::Direct,
        );
        for i in 0..record.steps.len() {
            record
                .finish_step(i, StepStatus::Succeeded, 1, None, None)
                .unwrap();
        }
        (record, scenario.expected_outcome)
    }

    fn judge(grader: Arc<dyn Grader>, max_invocations: u32, quorum: u32) -> Judge {
        let config = JudgeConfig {
            max_invocations,
            quorum,
            ..Default::default()
        };
        Judge::new(grader, &config)
    }

    #[tokio::test]
    async fn test_quorum_reached_stops_early() {
        let (record, expected) = completed_record();
        let grader = Scripted::new(vec![Ok(Decision::Pass), Ok(Decision::Pass)]);
        let verdict = judge(grader.clone(), 3, 2)
            .evaluate(&record, &expected)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Pass);
        assert_eq!(verdict.invocations, 2);
        assert_eq!(*grader.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_alternating_votes_reach_quorum_on_third() {
        let (record, expected) = completed_record();
        let grader = Scripted::new(vec![
            Ok(Decision::Pass),
            Ok(Decision::Fail),
            Ok(Decision::Pass),
        ]);
        let verdict = judge(grader, 3, 2).evaluate(&record, &expected).await.unwrap();
        assert_eq!(verdict.decision, Decision::Pass);
        assert_eq!(verdict.invocations, 3);
    }

    #[tokio::test]
    async fn test_no_quorum_is_inconclusive_after_budget() {
        let (record, expected) = completed_record();
        let grader = Scripted::new(vec![
            Ok(Decision::Pass),
            Ok(Decision::Fail),
            Err(GraderError::Malformed("no JSON".into())),
        ]);
        let verdict = judge(grader.clone(), 3, 2)
            .evaluate(&record, &expected)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Inconclusive);
        assert_eq!(verdict.invocations, 3);
        assert_eq!(*grader.calls.lock().unwrap(), 3);
        assert_eq!(record.status_from_verdict(), RunState::Failed);
    }

    #[tokio::test]
    async fn test_unreachable_grader_is_an_error() {
        let (record, expected) = completed_record();
        let grader = Scripted::new(vec![
            Ok(Decision::Pass),
            Err(GraderError::Unreachable("connection refused".into())),
        ]);
        let err = judge(grader, 3, 2)
            .evaluate(&record, &expected)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EvaluationError::Unreachable {
                message: "connection refused".into(),
                invocations: 2
            }
        );
    }

    #[tokio::test]
    async fn test_failed_assertion_short_circuits() {
        let (mut record, expected) = completed_record();
        let result = AssertionResult {
            passed: false,
            expected: AssertionSpec::default(),
            observed: None,
            mismatches: vec!["expected 1 match(es), found 0".into()],
        };
        // Non-blocking step: still a deterministic fail
        record
            .finish_step(1, StepStatus::Failed, 1, None, Some(result))
            .unwrap();
        let grader = Scripted::new(vec![]);
        let verdict = judge(grader.clone(), 3, 2)
            .evaluate(&record, &expected)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Fail);
        assert_eq!(verdict.invocations, 0);
        assert_eq!(*grader.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocking_timeout_short_circuits() {
        let (mut record, expected) = completed_record();
        record
            .finish_step(0, StepStatus::TimedOut, 1, Some("Timed out after 10ms".into()), None)
            .unwrap();
        let verdict = Judge::deterministic()
            .evaluate(&record, &expected)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Fail);
    }

    #[tokio::test]
    async fn test_deterministic_pass_counts_soft_failures() {
        let (mut record, expected) = completed_record();
        record
            .finish_step(1, StepStatus::Failed, 3, Some("not rendered".into()), None)
            .unwrap();
        let verdict = Judge::deterministic()
            .evaluate(&record, &expected)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Pass);
        assert_eq!(verdict.confidence, 0.5);
        assert_eq!(verdict.invocations, 0);
    }

    #[tokio::test]
    async fn test_steps_that_never_ran_fail_without_grading() {
        let (mut record, expected) = completed_record();
        // The non-blocking second step was still queued when time ran out
        record.steps[1].status = StepStatus::Pending;
        record.skip_remaining(1, "scenario timeout").unwrap();

        let grader = Scripted::new(vec![]);
        let verdict = judge(grader.clone(), 3, 2)
            .evaluate(&record, &expected)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Fail);
        assert!(verdict.rationale.contains("never ran: scenario timeout"));
        assert_eq!(*grader.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejected_request_is_reported_as_such() {
        let (record, expected) = completed_record();
        let grader = Scripted::new(vec![Err(GraderError::Rejected(
            "HTTP 401 Unauthorized; is JUDGE_API_KEY set?".into(),
        ))]);
        let err = judge(grader.clone(), 3, 2)
            .evaluate(&record, &expected)
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::Rejected { invocations: 1, .. }));
        assert!(err.to_string().contains("rejected the request"));
        assert_eq!(*grader.calls.lock().unwrap(), 1);
    }
}
