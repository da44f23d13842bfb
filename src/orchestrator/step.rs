//! Executing a single step against the driver

use std::time::Duration;
use tokio::time::Instant;

use super::record::{AssertionResult, StepExecutionError, StepStatus};
use crate::driver::{Driver, DriverError};
use crate::scenario::{interpret, Instruction, Step, Target, WaitInstruction};

/// Retry policy for transient driver errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub retries: u32,
    /// Backoff before attempt `n + 1` is `backoff * n`
    pub backoff: Duration,
}

/// Result of executing one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: StepStatus,
    pub attempts: u32,
    pub error: Option<StepExecutionError>,
    pub assertion: Option<AssertionResult>,
}

impl StepResult {
    fn succeeded(attempts: u32, assertion: Option<AssertionResult>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            attempts,
            error: None,
            assertion,
        }
    }

    fn failed(attempts: u32, error: StepExecutionError) -> Self {
        let status = match error {
            StepExecutionError::TimedOut { .. } => StepStatus::TimedOut,
            _ => StepStatus::Failed,
        };
        Self {
            status,
            attempts,
            error: Some(error),
            assertion: None,
        }
    }
}

enum Attempt {
    Done,
    Checked(AssertionResult),
}

/// Execute one step within `timeout`, retrying transient driver errors
pub async fn execute_step(
    driver: &dyn Driver,
    step: &Step,
    timeout: Duration,
    policy: RetryPolicy,
) -> StepResult {
    let instruction = match interpret(step) {
        Ok(instruction) => instruction,
        Err(problems) => {
            let detail = problems
                .iter()
                .map(|p| format!("{}: {}", p.field, p.kind))
                .collect::<Vec<_>>()
                .join(", ");
            return StepResult::failed(0, StepExecutionError::InvalidStep(detail));
        }
    };

    let timed_out = StepExecutionError::TimedOut {
        after_ms: timeout.as_millis() as u64,
    };
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return StepResult::failed(attempts - 1, timed_out);
        }

        let attempt = tokio::time::timeout(
            remaining,
            attempt(driver, &instruction, step.target.as_ref(), remaining),
        )
        .await;

        match attempt {
            Err(_) => return StepResult::failed(attempts, timed_out),
            Ok(Ok(Attempt::Done)) => return StepResult::succeeded(attempts, None),
            Ok(Ok(Attempt::Checked(result))) if result.passed => {
                return StepResult::succeeded(attempts, Some(result))
            }
            // Mismatches describe the present state; retrying cannot change them
            Ok(Ok(Attempt::Checked(result))) => {
                let error = StepExecutionError::AssertionFailed(result.mismatches.join("; "));
                return StepResult {
                    status: StepStatus::Failed,
                    attempts,
                    error: Some(error),
                    assertion: Some(result),
                };
            }
            Ok(Err(e)) if e.is_transient() && attempts <= policy.retries => {
                tracing::debug!(attempts, "Transient driver error, retrying: {}", e);
                let backoff = policy.backoff * attempts;
                let remaining = deadline.saturating_duration_since(Instant::now());
                if backoff >= remaining {
                    tokio::time::sleep(remaining).await;
                    return StepResult::failed(attempts, timed_out);
                }
                tokio::time::sleep(backoff).await;
            }
            Ok(Err(e)) if e.is_transient() => {
                return StepResult::failed(
                    attempts,
                    StepExecutionError::RetriesExhausted { attempts, last: e },
                );
            }
            Ok(Err(e)) => return StepResult::failed(attempts, StepExecutionError::Driver(e)),
        }
    }
}

async fn attempt(
    driver: &dyn Driver,
    instruction: &Instruction,
    target: Option<&Target>,
    remaining: Duration,
) -> Result<Attempt, DriverError> {
    match instruction {
        Instruction::Action(action) => {
            driver.perform(action, target).await?;
            Ok(Attempt::Done)
        }
        Instruction::Wait(WaitInstruction::Pause { duration }) => {
            tokio::time::sleep(*duration).await;
            Ok(Attempt::Done)
        }
        Instruction::Wait(WaitInstruction::Element { state }) => {
            let target = target.ok_or_else(|| DriverError::Failed("wait step has no target".into()))?;
            driver.wait_for(target, *state, remaining).await?;
            Ok(Attempt::Done)
        }
        Instruction::Assertion(expected) => {
            let target =
                target.ok_or_else(|| DriverError::Failed("assertion step has no target".into()))?;
            let observed = driver.inspect(target).await?;
            Ok(Attempt::Checked(AssertionResult::check(expected, observed)))
        }
    }
}
