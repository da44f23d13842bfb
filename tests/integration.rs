//! End-to-end integration tests for the UX test engine
//!
//! These tests drive the orchestrator, comparison engine and watch
//! controller with:
//! 1. In-process fakes (recording provisioner, scripted driver, stub grader)
//!    that log every lifecycle call so teardown ordering can be asserted
//! 2. The `mock_driver` binary speaking the real driver wire protocol

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uxtest::capture::{
    ActiveCapture, Artifact, ArtifactCaptureError, ArtifactKind, CaptureBackend, CaptureContext,
    CaptureEvent, ScreenshotCapture, ScreenshotMethod,
};
use uxtest::common::config::{DriverConfig, ExecutionConfig, JudgeConfig};
use uxtest::compare::ComparisonEngine;
use uxtest::driver::{Driver, DriverConnector, DriverError, ElementSnapshot, ProcessDriverConnector};
use uxtest::judge::{Decision, GradeRequest, GradeResponse, Grader, GraderError, Judge};
use uxtest::orchestrator::{
    execute_step, BatchRunner, ExecutionMode, Orchestrator, RetryPolicy, RunOptions, RunRecord,
    RunState, StepStatus,
};
use uxtest::provision::{EnvironmentHandle, ProvisionError, ProvisionRequest, Provisioner};
use uxtest::scenario::{
    ActionInstruction, Channel, ScenarioDefinition, Target, Validator, VersionSpec, WaitState,
};
use uxtest::store::RunStore;
use uxtest::watch::{WatchController, WatchEvent};

/// Shared lifecycle log
type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("'{}' not in log: {:?}", entry, log))
}

// === Fakes ===

struct RecordingProvisioner {
    log: Log,
    root: PathBuf,
    fail: bool,
    acquired: AtomicUsize,
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn acquire(&self, request: &ProvisionRequest) -> Result<EnvironmentHandle, ProvisionError> {
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        push(&self.log, format!("acquire {}", n));
        if self.fail {
            return Err(ProvisionError::ChannelUnavailable {
                channel: request.version.channel.to_string(),
                searched: "code-insiders".to_string(),
            });
        }
        let dir = self.root.join(format!("env-{}", n));
        std::fs::create_dir_all(&dir).unwrap();
        Ok(EnvironmentHandle::new(format!("env-{}", n), request.version.channel, dir))
    }

    async fn release(&self, handle: EnvironmentHandle) {
        push(&self.log, format!("release {}", handle.id));
    }
}

/// Driver over a fixed scene
///
/// `.hang` never settles, `.broken` fails permanently, `.gone` reports a lost
/// connection; everything else is one visible element showing `text`. A
/// frozen driver never answers screenshot requests.
struct ScriptedDriver {
    log: Log,
    text: String,
    frozen: bool,
}

impl ScriptedDriver {
    fn check(&self, target: Option<&Target>) -> Result<(), DriverError> {
        match target.map(|t| t.value()) {
            Some(".broken") => Err(DriverError::Failed("element is detached".into())),
            Some(".gone") => Err(DriverError::Disconnected),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn perform(&self, _: &ActionInstruction, target: Option<&Target>) -> Result<(), DriverError> {
        self.check(target)
    }

    async fn wait_for(&self, target: &Target, _: WaitState, _: Duration) -> Result<(), DriverError> {
        if target.value() == ".hang" {
            std::future::pending::<()>().await;
        }
        self.check(Some(target))
    }

    async fn inspect(&self, target: &Target) -> Result<ElementSnapshot, DriverError> {
        self.check(Some(target))?;
        Ok(ElementSnapshot {
            count: 1,
            visible: true,
            text: Some(self.text.clone()),
        })
    }

    async fn screenshot(&self, _: &str) -> Result<Vec<u8>, DriverError> {
        if self.frozen {
            std::future::pending::<()>().await;
        }
        Ok(b"\x89PNG\r\n\x1a\nscripted".to_vec())
    }

    async fn close(&self) {
        push(&self.log, "driver.close");
    }
}

/// Connects scripted drivers; insiders shows different text than stable
struct ScriptedConnector {
    log: Log,
    frozen: bool,
}

#[async_trait]
impl DriverConnector for ScriptedConnector {
    async fn connect(&self, env: &EnvironmentHandle) -> Result<Arc<dyn Driver>, DriverError> {
        push(&self.log, format!("connect {}", env.id));
        let text = match env.channel {
            Channel::Stable => "Saved",
            Channel::Insiders => "Unsaved",
        };
        Ok(Arc::new(ScriptedDriver {
            log: self.log.clone(),
            text: text.to_string(),
            frozen: self.frozen,
        }))
    }
}

/// Capture backend that only records when it starts and stops
struct RecordingCapture {
    log: Log,
}

struct ActiveRecording {
    log: Log,
    run_id: String,
}

#[async_trait]
impl CaptureBackend for RecordingCapture {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn start(&self, ctx: &CaptureContext) -> Result<Box<dyn ActiveCapture>, ArtifactCaptureError> {
        push(&self.log, format!("capture.start {}", ctx.run_id));
        Ok(Box::new(ActiveRecording {
            log: self.log.clone(),
            run_id: ctx.run_id.clone(),
        }))
    }
}

#[async_trait]
impl ActiveCapture for ActiveRecording {
    async fn on_event(&mut self, _: &CaptureEvent) -> Result<(), ArtifactCaptureError> {
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Vec<Artifact>, ArtifactCaptureError> {
        push(&self.log, format!("capture.stop {}", self.run_id));
        Ok(Vec::new())
    }
}

struct StubGrader {
    decision: Decision,
    calls: AtomicU32,
}

#[async_trait]
impl Grader for StubGrader {
    async fn grade(&self, _: &GradeRequest) -> Result<GradeResponse, GraderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GradeResponse {
            decision: self.decision,
            confidence: 0.9,
            rationale: "stubbed".to_string(),
        })
    }
}

// === Harness ===

struct Harness {
    log: Log,
    _dir: tempfile::TempDir,
    orchestrator: Orchestrator,
    grader: Arc<StubGrader>,
}

struct HarnessOptions {
    fail_provisioning: bool,
    screenshots: bool,
    frozen_screenshots: bool,
    grader: Decision,
    execution: ExecutionConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            fail_provisioning: false,
            screenshots: false,
            frozen_screenshots: false,
            grader: Decision::Pass,
            execution: ExecutionConfig {
                step_timeout_ms: 2_000,
                retry_backoff_ms: 5,
                snapshot_timeout_ms: 1_000,
                ..Default::default()
            },
        }
    }
}

impl Harness {
    fn new(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let provisioner = Arc::new(RecordingProvisioner {
            log: log.clone(),
            root: dir.path().join("envs"),
            fail: options.fail_provisioning,
            acquired: AtomicUsize::new(0),
        });
        let grader = Arc::new(StubGrader {
            decision: options.grader,
            calls: AtomicU32::new(0),
        });
        let judge_config = JudgeConfig {
            max_invocations: 3,
            quorum: 2,
            ..Default::default()
        };
        let mut capture: Vec<Arc<dyn CaptureBackend>> =
            vec![Arc::new(RecordingCapture { log: log.clone() })];
        if options.screenshots {
            capture.push(Arc::new(
                ScreenshotCapture::new(ScreenshotMethod::Electron, Duration::ZERO)
                    .with_timeout(Duration::from_millis(200)),
            ));
        }

        let orchestrator = Orchestrator::new(
            provisioner,
            Arc::new(ScriptedConnector {
                log: log.clone(),
                frozen: options.frozen_screenshots,
            }),
            Arc::new(Judge::new(grader.clone(), &judge_config)),
            RunStore::new(dir.path().join("results")),
            options.execution,
        )
        .with_capture(capture);

        Self {
            log,
            _dir: dir,
            orchestrator,
            grader,
        }
    }

    async fn run(&self, scenario: &ScenarioDefinition) -> RunRecord {
        self.orchestrator
            .run(scenario, &RunOptions::default(), CancellationToken::new())
            .await
    }
}

fn scenario(yaml: &str) -> ScenarioDefinition {
    Validator::new(false).validate_str(yaml).unwrap().scenario
}

const SAVE_FILE: &str = r#"
id: save-file
title: Save a modified file
priority: P0
environment: { version: stable }
steps:
  - { kind: action, params: { action: run_command, command: "workbench.action.files.save" } }
  - { kind: assertion, target: { selector: ".tab.active" }, params: { text_equals: "Saved" } }
expectedOutcome: The tab shows the file as saved
"#;

// === Orchestrator ===

#[tokio::test]
async fn test_step_timeout_is_recorded_with_late_evidence() {
    let harness = Harness::new(HarnessOptions {
        screenshots: true,
        ..Default::default()
    });
    let scenario = scenario(
        r#"
id: hanging-wait
title: Wait for a panel that never appears
priority: P1
environment: { version: stable }
steps:
  - { kind: action, params: { action: run_command, command: "workbench.action.togglePanel" } }
  - { kind: wait, target: { selector: ".hang" }, params: { state: visible }, timeout: 150 }
expectedOutcome: The panel opens
"#,
    );

    let record = harness.run(&scenario).await;

    let statuses: Vec<StepStatus> = record.steps.iter().map(|s| s.status).collect();
    assert_eq!(statuses, vec![StepStatus::Succeeded, StepStatus::TimedOut]);
    assert_eq!(record.state, RunState::Failed);

    let timed_out_at = record.steps[1].started_at.unwrap() + chrono::Duration::milliseconds(150);
    let evidence: Vec<&Artifact> = record
        .artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::Screenshot && a.step_index == Some(1))
        .collect();
    assert!(!evidence.is_empty(), "no screenshot for the timed out step");
    assert!(evidence.iter().all(|a| a.captured_at >= timed_out_at));
    assert!(evidence.iter().all(|a| a.path.exists()));
}

#[tokio::test]
async fn test_blocking_failure_never_passes() {
    let harness = Harness::new(HarnessOptions::default());
    let scenario = scenario(
        r#"
id: click-detached
title: Click a detached element
priority: P1
environment: { version: stable }
steps:
  - { kind: action, target: { selector: ".broken" }, params: { action: click } }
  - { kind: action, params: { action: press, key: "Enter" } }
  - { kind: action, params: { action: press, key: "Escape" } }
expectedOutcome: The dialog closes
"#,
    );

    let record = harness.run(&scenario).await;

    assert_eq!(record.state, RunState::Failed);
    assert_eq!(record.steps[0].status, StepStatus::Failed);
    assert_eq!(record.steps[1].status, StepStatus::Skipped);
    assert_eq!(record.steps[2].status, StepStatus::Skipped);
    // Decided without asking the grader
    assert_eq!(harness.grader.calls.load(Ordering::SeqCst), 0);
    assert_eq!(record.verdict.as_ref().unwrap().decision, Decision::Fail);
}

#[tokio::test]
async fn test_lost_driver_is_an_infrastructure_error() {
    let harness = Harness::new(HarnessOptions::default());
    let scenario = scenario(
        r#"
id: lost-driver
title: Driver disconnects
priority: P2
environment: { version: stable }
steps:
  - { kind: action, target: { selector: ".gone" }, params: { action: click } }
  - { kind: action, params: { action: press, key: "Enter" } }
expectedOutcome: Nothing
"#,
    );

    let record = harness.run(&scenario).await;
    assert_eq!(record.state, RunState::Errored);
    assert_eq!(record.steps[1].status, StepStatus::Skipped);
    assert!(record.verdict.is_none());
}

#[tokio::test]
async fn test_non_blocking_failure_continues() {
    let harness = Harness::new(HarnessOptions::default());
    let scenario = scenario(
        r#"
id: optional-hover
title: Hover is optional
priority: P2
environment: { version: stable }
steps:
  - { kind: action, target: { selector: ".broken" }, params: { action: hover }, blocking: false }
  - { kind: action, params: { action: press, key: "Enter" } }
expectedOutcome: Enter is handled
"#,
    );

    let record = harness.run(&scenario).await;
    assert_eq!(record.steps[0].status, StepStatus::Failed);
    assert_eq!(record.steps[1].status, StepStatus::Succeeded);
    assert_eq!(record.state, RunState::Passed);
    assert_eq!(harness.grader.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_provisioning_failure_is_errored() {
    let harness = Harness::new(HarnessOptions {
        fail_provisioning: true,
        ..Default::default()
    });
    let record = harness.run(&scenario(SAVE_FILE)).await;

    assert_eq!(record.state, RunState::Errored);
    assert!(record.reason.as_deref().unwrap().contains("not installed"));
    assert!(record.steps.iter().all(|s| s.status == StepStatus::Skipped));
    let log = entries(&harness.log);
    assert!(!log.iter().any(|e| e.starts_with("connect")));
}

#[tokio::test]
async fn test_judged_pass_and_record_persisted() {
    let harness = Harness::new(HarnessOptions::default());
    let record = harness.run(&scenario(SAVE_FILE)).await;

    assert_eq!(record.state, RunState::Passed);
    let verdict = record.verdict.as_ref().unwrap();
    assert_eq!(verdict.decision, Decision::Pass);
    assert_eq!(verdict.invocations, 2);
    assert_eq!(record.mode, ExecutionMode::Direct);

    let run_dir = harness
        .orchestrator
        .store()
        .run_dir(&record.scenario_id, &record.run_id);
    let saved = harness
        .orchestrator
        .store()
        .load_run(&run_dir.join("run.json"))
        .unwrap();
    assert_eq!(saved.run_id, record.run_id);
    assert_eq!(saved.state, RunState::Passed);
    assert_eq!(saved.steps, record.steps);
    assert_eq!(saved.verdict.unwrap().decision, Decision::Pass);
    assert!(!run_dir.join("checkpoint.json").exists());
}

#[tokio::test]
async fn test_grader_fail_fails_the_run() {
    let harness = Harness::new(HarnessOptions {
        grader: Decision::Fail,
        ..Default::default()
    });
    let record = harness.run(&scenario(SAVE_FILE)).await;
    assert_eq!(record.state, RunState::Failed);
    assert!(record.steps.iter().all(|s| s.status == StepStatus::Succeeded));
}

#[tokio::test]
async fn test_orchestrated_mode_writes_checkpoint() {
    let harness = Harness::new(HarnessOptions::default());
    let options = RunOptions {
        force_orchestrated: true,
        ..Default::default()
    };
    let record = harness
        .orchestrator
        .run(&scenario(SAVE_FILE), &options, CancellationToken::new())
        .await;

    assert_eq!(record.mode, ExecutionMode::Orchestrated);
    let run_dir = harness
        .orchestrator
        .store()
        .run_dir(&record.scenario_id, &record.run_id);
    let checkpoint = harness
        .orchestrator
        .store()
        .load_run(&run_dir.join("checkpoint.json"))
        .unwrap();
    assert_eq!(checkpoint.steps.len(), 2);
    assert!(checkpoint
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Succeeded));
}

#[tokio::test]
async fn test_teardown_order() {
    let harness = Harness::new(HarnessOptions::default());
    let record = harness.run(&scenario(SAVE_FILE)).await;

    let log = entries(&harness.log);
    let stop = position(&log, &format!("capture.stop {}", record.run_id));
    let close = position(&log, "driver.close");
    let release = position(&log, "release env-1");
    assert!(position(&log, "acquire 1") < position(&log, "connect env-1"));
    assert!(stop < close && close < release);
}

const PAUSES: &str = r#"
id: long-pauses
title: Many short pauses
priority: P2
environment: { version: stable }
steps:
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
  - { kind: wait, params: { duration_ms: 40 } }
expectedOutcome: Time passes
"#;

#[tokio::test]
async fn test_cancellation_between_steps() {
    let harness = Harness::new(HarnessOptions::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let record = harness
        .orchestrator
        .run(&scenario(PAUSES), &RunOptions::default(), cancel)
        .await;

    assert_eq!(record.state, RunState::Skipped);
    assert_eq!(record.reason.as_deref(), Some("cancelled"));
    let succeeded = record
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .count();
    assert!(succeeded >= 1 && succeeded < 10);
    assert!(record.steps[succeeded..]
        .iter()
        .all(|s| s.status == StepStatus::Skipped));

    let log = entries(&harness.log);
    assert!(log.contains(&"release env-1".to_string()));
    assert!(log.contains(&format!("capture.stop {}", record.run_id)));
}

#[tokio::test]
async fn test_cancelled_before_provisioning() {
    let harness = Harness::new(HarnessOptions::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let record = harness
        .orchestrator
        .run(&scenario(SAVE_FILE), &RunOptions::default(), cancel)
        .await;
    assert_eq!(record.state, RunState::Skipped);
    assert!(entries(&harness.log).is_empty());
}

#[tokio::test]
async fn test_unanswered_screenshots_do_not_hold_up_release() {
    let harness = Harness::new(HarnessOptions {
        screenshots: true,
        frozen_screenshots: true,
        ..Default::default()
    });
    let scenario = scenario(
        r#"
id: frozen-renderer
title: Renderer stops painting
priority: P1
environment: { version: stable }
steps:
  - { kind: action, params: { action: run_command, command: "workbench.action.reloadWindow" } }
expectedOutcome: The window reloads
"#,
    );

    let record = tokio::time::timeout(Duration::from_secs(10), harness.run(&scenario))
        .await
        .expect("run finished");

    let log = entries(&harness.log);
    assert!(position(&log, "driver.close") < position(&log, "release env-1"));
    assert!(record.state.is_terminal());
    assert!(record
        .warnings
        .iter()
        .any(|w| w.contains("not taken within 200ms")));
}

#[tokio::test]
async fn test_exhausted_scenario_budget_never_passes() {
    let harness = Harness::new(HarnessOptions::default());
    let scenario = scenario(
        r#"
id: slow-optional-steps
title: Optional pauses outlast the budget
priority: P2
environment: { version: stable }
timeouts: { scenario: 150 }
steps:
  - { kind: wait, params: { duration_ms: 100 }, blocking: false }
  - { kind: wait, params: { duration_ms: 100 }, blocking: false }
  - { kind: wait, params: { duration_ms: 100 }, blocking: false }
expectedOutcome: Time passes
"#,
    );

    let record = harness.run(&scenario).await;

    let statuses: Vec<StepStatus> = record.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Succeeded, StepStatus::TimedOut, StepStatus::Skipped]
    );
    assert_eq!(record.state, RunState::Failed);
    assert_eq!(record.reason.as_deref(), Some("scenario timeout"));
    assert_eq!(record.verdict.as_ref().unwrap().decision, Decision::Fail);
    assert_eq!(harness.grader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_step_timeout_is_clipped_to_scenario_budget() {
    let harness = Harness::new(HarnessOptions::default());
    let scenario = scenario(
        r#"
id: clipped-wait
title: Wait longer than the whole scenario may take
priority: P2
environment: { version: stable }
timeouts: { scenario: 300 }
steps:
  - { kind: wait, target: { selector: ".hang" }, params: { state: visible }, blocking: false }
  - { kind: action, params: { action: press, key: "Escape" } }
expectedOutcome: The panel opens
"#,
    );

    let started = Instant::now();
    let record = harness.run(&scenario).await;

    // The 2s step default gave way to the 300ms scenario budget
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(record.mode, ExecutionMode::Direct);
    assert_eq!(record.steps[0].status, StepStatus::TimedOut);
    assert_eq!(record.steps[1].status, StepStatus::Skipped);
    assert_eq!(record.state, RunState::Failed);
}

#[tokio::test]
async fn test_many_steps_select_orchestrated_mode() {
    let harness = Harness::new(HarnessOptions {
        execution: ExecutionConfig {
            step_timeout_ms: 200,
            orchestrated_step_threshold: 3,
            ..Default::default()
        },
        ..Default::default()
    });
    let options = RunOptions::default();

    assert_eq!(
        harness.orchestrator.select_mode(&scenario(SAVE_FILE), &options),
        ExecutionMode::Direct
    );
    assert_eq!(
        harness.orchestrator.select_mode(&scenario(PAUSES), &options),
        ExecutionMode::Orchestrated
    );
}

#[tokio::test]
async fn test_long_worst_case_selects_orchestrated_mode() {
    let harness = Harness::new(HarnessOptions {
        execution: ExecutionConfig {
            step_timeout_ms: 2_000,
            orchestrated_duration_secs: 3,
            ..Default::default()
        },
        ..Default::default()
    });

    // Two steps of 2s each exceed the 3s threshold
    let record = harness.run(&scenario(SAVE_FILE)).await;
    assert_eq!(record.mode, ExecutionMode::Orchestrated);
    assert_eq!(record.state, RunState::Passed);
    let run_dir = harness
        .orchestrator
        .store()
        .run_dir(&record.scenario_id, &record.run_id);
    assert!(run_dir.join("checkpoint.json").exists());
}

// === Batches ===

fn short_scenario(id: &str) -> ScenarioDefinition {
    scenario(&format!(
        r#"
id: {}
title: Three short pauses
priority: P2
environment: {{ version: stable }}
steps:
  - {{ kind: wait, params: {{ duration_ms: 60 }} }}
  - {{ kind: wait, params: {{ duration_ms: 60 }} }}
  - {{ kind: wait, params: {{ duration_ms: 60 }} }}
expectedOutcome: Time passes
"#,
        id
    ))
}

#[tokio::test]
async fn test_batch_runs_in_parallel_within_limit() {
    let harness = Harness::new(HarnessOptions::default());
    let scenarios = vec![
        short_scenario("pause-a"),
        short_scenario("pause-b"),
        short_scenario("pause-c"),
    ];

    let records = BatchRunner::new(harness.orchestrator.clone(), 2)
        .run(&scenarios, &RunOptions::default(), CancellationToken::new())
        .await;

    let ids: Vec<&str> = records.iter().map(|r| r.scenario_id.as_str()).collect();
    assert_eq!(ids, vec!["pause-a", "pause-b", "pause-c"]);
    assert!(records.iter().all(|r| r.state == RunState::Passed));

    let mut live = 0i32;
    let mut most_live = 0i32;
    for entry in entries(&harness.log) {
        if entry.starts_with("acquire") {
            live += 1;
        } else if entry.starts_with("release") {
            live -= 1;
        }
        most_live = most_live.max(live);
    }
    assert_eq!(most_live, 2);
    assert_eq!(live, 0);
}

#[tokio::test]
async fn test_cancelled_batch_skips_every_run() {
    let harness = Harness::new(HarnessOptions::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let records = BatchRunner::new(harness.orchestrator.clone(), 2)
        .run(
            &[short_scenario("pause-a"), short_scenario("pause-b")],
            &RunOptions::default(),
            cancel,
        )
        .await;

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.state == RunState::Skipped));
    assert!(entries(&harness.log).is_empty());
}

// === Comparison ===

#[tokio::test]
async fn test_comparison_names_divergent_step() {
    let harness = Harness::new(HarnessOptions::default());
    let engine = ComparisonEngine::new(harness.orchestrator.clone(), 2);
    let versions: Vec<VersionSpec> = vec!["stable".parse().unwrap(), "insiders".parse().unwrap()];

    let result = engine
        .compare(
            &scenario(SAVE_FILE),
            &versions,
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.runs.len(), 2);
    assert_eq!(result.runs["stable"].state, RunState::Passed);
    assert_eq!(result.runs["insiders"].state, RunState::Failed);
    assert_eq!(result.diff.divergent_steps, BTreeSet::from([1]));
    assert!(result.diff.status_divergent);

    let path = harness.orchestrator.store().save_comparison(&result).unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_comparison_of_identical_versions_is_consistent() {
    let harness = Harness::new(HarnessOptions::default());
    let engine = ComparisonEngine::new(harness.orchestrator.clone(), 1);
    let versions: Vec<VersionSpec> = vec![
        "stable".parse().unwrap(),
        "stable@>=1.0".parse().unwrap(),
    ];

    let result = engine
        .compare(
            &scenario(SAVE_FILE),
            &versions,
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.is_consistent(), "{}", result.diff.description);
    // One environment at a time: each release precedes the next acquire
    let log = entries(&harness.log);
    assert!(position(&log, "release env-1") < position(&log, "acquire 2"));
}

#[tokio::test]
async fn test_provisioning_failure_is_local_to_its_run() {
    let harness = Harness::new(HarnessOptions {
        fail_provisioning: true,
        ..Default::default()
    });
    let engine = ComparisonEngine::new(harness.orchestrator.clone(), 2);
    let versions: Vec<VersionSpec> = vec!["stable".parse().unwrap(), "insiders".parse().unwrap()];

    let result = engine
        .compare(
            &scenario(SAVE_FILE),
            &versions,
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.runs.values().all(|r| r.state == RunState::Errored));
}

// === Watch mode ===

#[tokio::test]
async fn test_watch_rerun_tears_down_before_next_acquire() {
    let harness = Arc::new(Harness::new(HarnessOptions::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let runs = harness.clone();
    let stop = shutdown.clone();
    let controller = tokio::spawn(async move {
        WatchController::new(Duration::from_millis(30))
            .run(rx, stop, move |_, cancel| {
                let harness = runs.clone();
                async move {
                    let scenario = scenario(PAUSES);
                    harness
                        .orchestrator
                        .run(&scenario, &RunOptions::default(), cancel)
                        .await;
                }
            })
            .await
    });

    // Two changes inside the debounce window start one run
    tx.send(WatchEvent::Changed("scenarios/a.yaml".into())).unwrap();
    tx.send(WatchEvent::Changed("scenarios/a.yaml".into())).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    // The run takes ~400ms; this change arrives mid-run
    tx.send(WatchEvent::Changed("scenarios/b.yaml".into())).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    shutdown.cancel();

    let summary = controller.await.unwrap();
    assert_eq!(summary.runs_started, 2);
    assert_eq!(summary.runs_cancelled, 2);

    let log = entries(&harness.log);
    let first_stop = log
        .iter()
        .position(|e| e.starts_with("capture.stop"))
        .unwrap();
    let next_acquire = position(&log, "acquire 2");
    assert!(first_stop < next_acquire);
    assert!(position(&log, "release env-1") < next_acquire);
    assert_eq!(log.iter().filter(|e| e.starts_with("acquire")).count(), 2);
}

// === Mock driver over the wire protocol ===

fn mock_driver_connector() -> ProcessDriverConnector {
    ProcessDriverConnector::new(DriverConfig {
        command: PathBuf::from(env!("CARGO_BIN_EXE_mock_driver")),
        args: Vec::new(),
        connect_timeout_secs: 10,
    })
}

fn mock_environment(dir: &tempfile::TempDir) -> EnvironmentHandle {
    EnvironmentHandle::new("mock", Channel::Stable, dir.path().to_path_buf())
}

#[tokio::test]
async fn test_mock_driver_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let driver = mock_driver_connector()
        .connect(&mock_environment(&dir))
        .await
        .unwrap();

    let editor = Target::Selector(".monaco-editor".into());
    let dirty = Target::Selector(".tab.active.dirty".into());

    driver
        .perform(&ActionInstruction::Type { text: "hello".into() }, Some(&editor))
        .await
        .unwrap();
    assert_eq!(driver.inspect(&editor).await.unwrap().text.as_deref(), Some("hello"));
    assert_eq!(driver.inspect(&dirty).await.unwrap().count, 1);

    driver
        .perform(&ActionInstruction::Press { key: "Control+S".into() }, None)
        .await
        .unwrap();
    assert_eq!(driver.inspect(&dirty).await.unwrap().count, 0);

    let err = driver
        .perform(&ActionInstruction::Click, Some(&Target::Selector(".broken".into())))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Failed(_)));

    let png = driver.screenshot("electron").await.unwrap();
    assert!(png.starts_with(b"\x89PNG"));

    driver.close().await;
}

#[tokio::test]
async fn test_mock_driver_hang_does_not_block_other_requests() {
    let dir = tempfile::tempdir().unwrap();
    let driver = mock_driver_connector()
        .connect(&mock_environment(&dir))
        .await
        .unwrap();

    let hang = Target::Selector(".hang".into());
    let waited = tokio::time::timeout(
        Duration::from_millis(200),
        driver.wait_for(&hang, WaitState::Visible, Duration::from_millis(200)),
    )
    .await;
    assert!(waited.is_err(), "hanging selector answered");

    // Responses are routed by sequence number, not arrival order
    let tab = driver
        .inspect(&Target::Selector(".tab.active".into()))
        .await
        .unwrap();
    assert_eq!(tab.text.as_deref(), Some("basic.txt"));

    driver.close().await;
}

#[tokio::test]
async fn test_mock_driver_slow_element_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let driver = mock_driver_connector()
        .connect(&mock_environment(&dir))
        .await
        .unwrap();

    let scenario = scenario(
        r#"
id: slow-panel
title: Slow panel
priority: P2
environment: { version: stable }
steps:
  - { kind: assertion, target: { selector: ".slow" }, params: { text_equals: "ready" } }
expectedOutcome: Panel renders
"#,
    );
    let policy = RetryPolicy {
        retries: 2,
        backoff: Duration::from_millis(5),
    };
    let result = execute_step(driver.as_ref(), &scenario.steps[0], Duration::from_secs(5), policy).await;

    assert_eq!(result.status, StepStatus::Succeeded);
    assert_eq!(result.attempts, 3);
    driver.close().await;
}

#[tokio::test]
async fn test_full_run_through_mock_driver() {
    let dir = tempfile::tempdir().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = Orchestrator::new(
        Arc::new(RecordingProvisioner {
            log: log.clone(),
            root: dir.path().join("envs"),
            fail: false,
            acquired: AtomicUsize::new(0),
        }),
        Arc::new(mock_driver_connector()),
        Arc::new(Judge::deterministic()),
        RunStore::new(dir.path().join("results")),
        ExecutionConfig::default(),
    )
    .with_capture(vec![Arc::new(ScreenshotCapture::new(
        ScreenshotMethod::Electron,
        Duration::ZERO,
    ))]);

    let scenario = scenario(
        r#"
id: save-file
title: Save a modified file
priority: P0
environment: { version: stable }
steps:
  - { kind: action, target: { selector: ".monaco-editor" }, params: { action: type, text: "hello" } }
  - { kind: wait, target: { selector: ".tab.active.dirty" }, params: { state: visible } }
  - { kind: action, params: { action: press, key: "Control+S" } }
expectedOutcome:
  description: The file is saved
  assertions:
    - target: { selector: ".tab.active.dirty" }
      count: 0
"#,
    );

    let record = orchestrator
        .run(&scenario, &RunOptions::default(), CancellationToken::new())
        .await;

    assert_eq!(record.state, RunState::Passed, "{:?}", record.reason);
    assert_eq!(record.final_checks.len(), 1);
    assert!(record.final_checks[0].passed);
    assert_eq!(
        record
            .artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Screenshot)
            .count(),
        3
    );
}
