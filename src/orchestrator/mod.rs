//! Execution orchestrator
//!
//! Drives one scenario through `Provisioning -> Running -> Evaluating ->
//! Finalizing` to a terminal state. Steps run strictly in order; capture runs
//! beside them on its own tasks. Whatever happens, capture is stopped and the
//! environment released before the run is evaluated and finalized.

mod batch;
mod record;
mod step;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureBackend, CaptureContext, CaptureSession};
use crate::common::config::ExecutionConfig;
use crate::driver::{Driver, DriverConnector};
use crate::judge::Judge;
use crate::provision::{EnvironmentHandle, IsolationMode, ProvisionRequest, Provisioner};
use crate::scenario::{ScenarioDefinition, VersionSpec};
use crate::store::RunStore;

pub use batch::BatchRunner;
pub use record::{
    AssertionResult, ExecutionMode, FinalCheck, RecordError, RunRecord, RunState,
    StepExecutionError, StepOutcome, StepStatus,
};
pub use step::{execute_step, RetryPolicy, StepResult};

/// Per-invocation choices
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub isolation: IsolationMode,
    /// Overrides the scenario's version, e.g. one side of a comparison
    pub version: Option<VersionSpec>,
    /// Overrides the scenario's profile
    pub profile: Option<String>,
    /// Checkpoint after every step regardless of scenario size
    pub force_orchestrated: bool,
    /// Record video, screenshots and logs
    pub capture_artifacts: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::SandboxReset,
            version: None,
            profile: None,
            force_orchestrated: false,
            capture_artifacts: true,
        }
    }
}

/// How the step sequence ended
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    /// Every step ran (some non-blocking ones may have failed)
    Completed,
    /// A blocking step failed
    Aborted,
    /// The direct-mode scenario budget ran out
    OutOfTime,
    Cancelled,
    /// The tooling failed, not the editor
    Errored(String),
}

/// Runs scenarios end to end
#[derive(Clone)]
pub struct Orchestrator {
    provisioner: Arc<dyn Provisioner>,
    connector: Arc<dyn DriverConnector>,
    judge: Arc<Judge>,
    store: RunStore,
    capture: Vec<Arc<dyn CaptureBackend>>,
    settings: ExecutionConfig,
}

impl Orchestrator {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        connector: Arc<dyn DriverConnector>,
        judge: Arc<Judge>,
        store: RunStore,
        settings: ExecutionConfig,
    ) -> Self {
        Self {
            provisioner,
            connector,
            judge,
            store,
            capture: Vec::new(),
            settings,
        }
    }

    /// Capture backends started for runs with artifacts enabled
    pub fn with_capture(mut self, backends: Vec<Arc<dyn CaptureBackend>>) -> Self {
        self.capture = backends;
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Direct or orchestrated, per options and scenario size
    pub fn select_mode(&self, scenario: &ScenarioDefinition, options: &RunOptions) -> ExecutionMode {
        let worst_case = scenario.worst_case_duration(self.step_timeout());
        if options.force_orchestrated
            || scenario.steps.len() > self.settings.orchestrated_step_threshold
            || worst_case > Duration::from_secs(self.settings.orchestrated_duration_secs)
        {
            ExecutionMode::Orchestrated
        } else {
            ExecutionMode::Direct
        }
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.step_timeout_ms)
    }

    fn scenario_budget(&self, scenario: &ScenarioDefinition) -> Duration {
        scenario
            .timeouts
            .scenario_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.settings.scenario_timeout_secs))
    }

    /// Run a scenario to a terminal state
    ///
    /// Never fails: provisioning, driver and evaluation problems end the run
    /// `Errored`, cancellation ends it `Skipped`.
    #[tracing::instrument(skip_all, fields(scenario = %scenario.id, run_id))]
    pub async fn run(
        &self,
        scenario: &ScenarioDefinition,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> RunRecord {
        let mode = self.select_mode(scenario, options);
        let version = options
            .version
            .clone()
            .unwrap_or_else(|| scenario.environment.version.clone());
        let mut record = RunRecord::new(new_run_id(), scenario, &version, mode);
        tracing::Span::current().record("run_id", record.run_id.as_str());
        tracing::info!(version = %version, mode = ?mode, "Starting run");

        if cancel.is_cancelled() {
            skip_all(&mut record, "cancelled before provisioning");
            return self.finalize(record, RunState::Skipped, Some("cancelled".to_string()));
        }

        let mut request = ProvisionRequest::for_scenario(scenario, options.isolation);
        request.version = version;
        if options.profile.is_some() {
            request.profile = options.profile.clone();
        }

        let handle = match self.provisioner.acquire(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Provisioning failed: {}", e);
                skip_all(&mut record, "environment unavailable");
                return self.finalize(record, RunState::Errored, Some(e.to_string()));
            }
        };
        record.environment = Some(handle.resolved());

        if cancel.is_cancelled() {
            self.provisioner.release(handle).await;
            skip_all(&mut record, "cancelled");
            return self.finalize(record, RunState::Skipped, Some("cancelled".to_string()));
        }

        let disposition = self
            .execute(&mut record, scenario, &handle, options, &cancel)
            .await;
        self.provisioner.release(handle).await;

        match disposition {
            Disposition::Cancelled => {
                return self.finalize(record, RunState::Skipped, Some("cancelled".to_string()))
            }
            Disposition::Errored(reason) => {
                return self.finalize(record, RunState::Errored, Some(reason))
            }
            Disposition::Completed | Disposition::Aborted | Disposition::OutOfTime => {}
        }

        // Evaluation reads artifacts only after capture has stopped
        transition(&mut record, RunState::Evaluating);
        match self.judge.evaluate(&record, &scenario.expected_outcome).await {
            Ok(verdict) => {
                tracing::info!(decision = verdict.decision.as_str(), invocations = verdict.invocations, "Verdict");
                let _ = record.set_verdict(verdict);
                let state = record.status_from_verdict();
                let reason = (disposition == Disposition::OutOfTime)
                    .then(|| "scenario timeout".to_string());
                self.finalize(record, state, reason)
            }
            Err(e) => {
                tracing::warn!("Evaluation failed: {}", e);
                self.finalize(record, RunState::Errored, Some(e.to_string()))
            }
        }
    }

    /// Connect, capture and run the steps; tears capture and driver down
    /// before returning
    async fn execute(
        &self,
        record: &mut RunRecord,
        scenario: &ScenarioDefinition,
        handle: &EnvironmentHandle,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Disposition {
        let driver = match self.connector.connect(handle).await {
            Ok(driver) => driver,
            Err(e) => {
                skip_all(record, "driver unavailable");
                return Disposition::Errored(format!("Automation driver: {}", e));
            }
        };

        let mut capture = if options.capture_artifacts {
            let ctx = CaptureContext::new(&record.run_id, &self.store.artifacts_dir(record), handle)
                .with_driver(driver.clone());
            CaptureSession::start(&self.capture, &ctx).await
        } else {
            CaptureSession::disabled()
        };

        transition(record, RunState::Running);
        let mut disposition = self
            .run_steps(record, scenario, driver.as_ref(), &mut capture, cancel)
            .await;
        if disposition == Disposition::Completed {
            if let Err(reason) = self.final_checks(record, scenario, driver.as_ref()).await {
                disposition = Disposition::Errored(reason);
            }
        }

        let report = capture
            .stop(Duration::from_millis(self.settings.capture_stop_timeout_ms))
            .await;
        let _ = record.add_artifacts(report.artifacts);
        for warning in report.warnings {
            let _ = record.add_warning(warning);
        }
        driver.close().await;
        disposition
    }

    async fn run_steps(
        &self,
        record: &mut RunRecord,
        scenario: &ScenarioDefinition,
        driver: &dyn Driver,
        capture: &mut CaptureSession,
        cancel: &CancellationToken,
    ) -> Disposition {
        let deadline = match record.mode {
            ExecutionMode::Direct => Some(Instant::now() + self.scenario_budget(scenario)),
            ExecutionMode::Orchestrated => None,
        };
        let policy = RetryPolicy {
            retries: self.settings.step_retries,
            backoff: Duration::from_millis(self.settings.retry_backoff_ms),
        };
        let snapshot_timeout = Duration::from_millis(self.settings.snapshot_timeout_ms);

        for (index, step) in scenario.steps.iter().enumerate() {
            // Cancellation is honored between steps, never mid-step
            if cancel.is_cancelled() {
                tracing::info!(step = index, "Run cancelled");
                let _ = record.skip_remaining(index, "cancelled");
                return Disposition::Cancelled;
            }

            let mut timeout = scenario.step_timeout(index, self.step_timeout());
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    let _ = record.skip_remaining(index, "scenario timeout");
                    return Disposition::OutOfTime;
                }
                timeout = timeout.min(remaining);
            }

            let _ = record.begin_step(index);
            capture.step_started(index);
            tracing::debug!(step = index, summary = %step.summary(), "Executing step");

            let result = execute_step(driver, step, timeout, policy).await;

            if result.status.is_failure() {
                // Evidence first, before anything is torn down
                let reason = result.status.as_str();
                capture.snapshot(reason, Some(index), snapshot_timeout).await;
                tracing::info!(
                    step = index,
                    status = reason,
                    error = result.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "Step did not succeed"
                );
            }

            let infrastructure = result
                .error
                .as_ref()
                .map(|e| e.is_infrastructure())
                .unwrap_or(false);
            let _ = record.finish_step(
                index,
                result.status,
                result.attempts,
                result.error.as_ref().map(|e| e.to_string()),
                result.assertion,
            );
            capture.step_finished(index, result.status.as_str());

            if record.mode == ExecutionMode::Orchestrated {
                if let Err(e) = self.store.save_checkpoint(record) {
                    tracing::warn!("Checkpoint not written: {}", e);
                    let _ = record.add_warning(format!("checkpoint after step {}: {}", index, e));
                }
            }

            if result.status.is_failure() && step.blocking {
                let _ = record.skip_remaining(index + 1, &format!("aborted after step {}", index));
                if infrastructure {
                    let reason = result
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "driver failure".to_string());
                    return Disposition::Errored(reason);
                }
                return Disposition::Aborted;
            }
            if let Some(deadline) = deadline {
                if result.status == StepStatus::TimedOut && Instant::now() >= deadline {
                    let _ = record.skip_remaining(index + 1, "scenario timeout");
                    return Disposition::OutOfTime;
                }
            }
        }

        Disposition::Completed
    }

    /// Check the structured assertions of the expected outcome
    async fn final_checks(
        &self,
        record: &mut RunRecord,
        scenario: &ScenarioDefinition,
        driver: &dyn Driver,
    ) -> Result<(), String> {
        for check in &scenario.expected_outcome.assertions {
            let target = check.target.to_string();
            let inspected =
                tokio::time::timeout(self.step_timeout(), driver.inspect(&check.target)).await;
            let final_check = match inspected {
                Ok(Ok(observed)) => {
                    let result = AssertionResult::check(&check.expect, observed);
                    FinalCheck {
                        target,
                        passed: result.passed,
                        result: Some(result),
                        error: None,
                    }
                }
                Ok(Err(e)) if e.is_infrastructure() => {
                    return Err(format!("Automation driver: {}", e));
                }
                Ok(Err(e)) => FinalCheck {
                    target,
                    passed: false,
                    result: None,
                    error: Some(e.to_string()),
                },
                Err(_) => FinalCheck {
                    target,
                    passed: false,
                    result: None,
                    error: Some(format!(
                        "timed out after {}ms",
                        self.settings.step_timeout_ms
                    )),
                },
            };
            let _ = record.add_final_check(final_check);
        }
        Ok(())
    }

    /// Errored stand-in for a run whose task panicked
    pub(crate) fn crashed_record(
        &self,
        scenario: &ScenarioDefinition,
        version: &VersionSpec,
        options: &RunOptions,
        reason: String,
    ) -> RunRecord {
        let mode = self.select_mode(scenario, options);
        let mut record = RunRecord::new(
            format!("crashed-{}", uuid::Uuid::new_v4().simple()),
            scenario,
            version,
            mode,
        );
        skip_all(&mut record, "run crashed");
        transition(&mut record, RunState::Finalizing);
        record.reason = Some(format!("run crashed: {}", reason));
        transition(&mut record, RunState::Errored);
        record
    }

    /// Persist and close the record
    fn finalize(&self, mut record: RunRecord, state: RunState, reason: Option<String>) -> RunRecord {
        transition(&mut record, RunState::Finalizing);
        record.reason = reason;
        transition(&mut record, state);
        if let Err(e) = self.store.save_run(&record) {
            tracing::warn!("Run record not written: {}", e);
        }
        tracing::info!(status = state.as_str(), "Run finished");
        record
    }
}

fn transition(record: &mut RunRecord, to: RunState) {
    if let Err(e) = record.advance(to) {
        tracing::error!(run_id = %record.run_id, "{}", e);
    }
}

fn skip_all(record: &mut RunRecord, reason: &str) {
    let _ = record.skip_remaining(0, reason);
}

/// Sortable, unique run id
fn new_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        &uuid[..8]
    )
}
