//! CLI command handling
//!
//! Wires the engine together from configuration, runs the selected scenarios
//! and prints the report. Command handlers return the process exit code.

mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::backends_for;
use crate::commands::{Commands, RunArgs};
use crate::common::config::Config;
use crate::common::error::{EXIT_PASSED, EXIT_VALIDATION};
use crate::common::{Error, Result};
use crate::compare::ComparisonEngine;
use crate::driver::ProcessDriverConnector;
use crate::judge::{HttpGrader, Judge};
use crate::orchestrator::{BatchRunner, Orchestrator, RunOptions, RunRecord};
use crate::provision::{EditorProvisioner, IsolationMode};
use crate::scenario::{load_file, scenario_files, ScenarioDefinition, ScenarioSet, Validator, VersionSpec};
use crate::store::RunStore;
use crate::watch::{self, WatchController, WatchEvent};

pub use report::Tally;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::List { tag, scenarios } => list(&scenarios, tag.as_deref()),
        Commands::Run(args) => run(args).await,
    }
}

fn list(dir: &std::path::Path, tag: Option<&str>) -> Result<i32> {
    let set = ScenarioSet::load_dir(dir, &Validator::new(false))?;
    let selected = set.select(None, tag)?;
    if selected.is_empty() {
        println!("No scenarios found in {}", dir.display());
        return Ok(EXIT_PASSED);
    }
    for loaded in selected {
        let s = &loaded.scenario;
        let tags = s.tags.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ");
        println!(
            "{:<32} {} {:<9} {}  {}",
            s.id.bold(),
            format!("{:?}", s.priority).yellow(),
            s.environment.version.to_string(),
            s.title,
            tags.dimmed()
        );
    }
    Ok(EXIT_PASSED)
}

async fn run(args: RunArgs) -> Result<i32> {
    let mut config = Config::load()?;
    if let Some(method) = args.screenshot_method {
        config.capture.screenshot_method = method;
    }
    if let Some(output) = &args.output {
        config.output.dir = output.clone();
    }

    let validator = Validator::new(args.strict);
    if args.validate {
        return Ok(validate_only(&args.scenarios, &validator));
    }

    let session = Session::build(&config, &args)?;
    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping after the current step");
            interrupt.cancel();
        }
    });

    if args.watch {
        return watch_mode(session, args, validator, config.watch.debounce_ms, shutdown).await;
    }

    let scenarios = select(&args, &validator)?;
    let tally = session.run_all(scenarios, shutdown).await?;
    report::print_summary(&tally);
    Ok(tally.exit_code())
}

/// Validate every scenario file, reporting all of them
fn validate_only(dir: &std::path::Path, validator: &Validator) -> i32 {
    let files = scenario_files(dir);
    if files.is_empty() {
        println!("No scenario files found in {}", dir.display());
        return EXIT_VALIDATION;
    }

    let mut invalid = 0;
    for path in &files {
        match load_file(path, validator) {
            Ok(loaded) => report::print_valid(&loaded),
            Err(e) => {
                invalid += 1;
                println!("{} {}", "✗".red(), e);
            }
        }
    }

    println!(
        "\n{} file(s) checked, {} invalid",
        files.len(),
        if invalid > 0 { invalid.to_string().red() } else { invalid.to_string().green() }
    );
    if invalid > 0 {
        EXIT_VALIDATION
    } else {
        EXIT_PASSED
    }
}

/// Scenarios picked by the run arguments
fn select(args: &RunArgs, validator: &Validator) -> Result<Vec<ScenarioDefinition>> {
    let set = ScenarioSet::load_dir(&args.scenarios, validator)?;
    let id = if args.all { None } else { args.scenario.as_deref() };
    let selected = set.select(id, args.tag.as_deref())?;
    if selected.is_empty() {
        return Err(Error::Config(format!(
            "No scenarios selected from {}",
            args.scenarios.display()
        )));
    }
    for loaded in &selected {
        for warning in &loaded.warnings {
            println!("{} {}: {}", "!".yellow(), loaded.path.display(), warning);
        }
    }
    Ok(selected.into_iter().map(|l| l.scenario.clone()).collect())
}

/// Everything needed to run scenarios, cheap to clone into watch reruns
#[derive(Clone)]
struct Session {
    orchestrator: Orchestrator,
    options: RunOptions,
    compare: Vec<VersionSpec>,
    max_parallel: usize,
}

impl Session {
    fn build(config: &Config, args: &RunArgs) -> Result<Self> {
        let judge = if args.no_llm {
            Judge::deterministic()
        } else {
            let grader = HttpGrader::new(&config.judge)
                .map_err(|e| Error::Config(format!("Judge backend: {}", e)))?;
            Judge::new(Arc::new(grader), &config.judge)
        };

        let capture = if args.no_artifacts {
            Vec::new()
        } else {
            backends_for(&config.capture, args.video)
        };

        let orchestrator = Orchestrator::new(
            Arc::new(EditorProvisioner::new(config)),
            Arc::new(ProcessDriverConnector::new(config.driver.clone())),
            Arc::new(judge),
            RunStore::new(config.output.dir.clone()),
            config.execution.clone(),
        )
        .with_capture(capture);

        let isolation = if args.fresh_profile {
            IsolationMode::FreshProfile
        } else if args.no_sandbox_reset {
            IsolationMode::Reuse
        } else {
            IsolationMode::SandboxReset
        };

        Ok(Self {
            orchestrator,
            options: RunOptions {
                isolation,
                version: args.vscode_version.clone(),
                profile: args.profile.clone(),
                force_orchestrated: args.orchestrated,
                capture_artifacts: !args.no_artifacts,
            },
            compare: args.compare.clone(),
            max_parallel: config.compare.max_parallel,
        })
    }

    /// Run a batch in parallel, or each comparison in turn, until done or
    /// cancelled
    async fn run_all(&self, scenarios: Vec<ScenarioDefinition>, cancel: CancellationToken) -> Result<Tally> {
        let mut tally = Tally::default();

        if self.compare.is_empty() {
            let batch = BatchRunner::new(self.orchestrator.clone(), self.max_parallel);
            let records = batch.run(&scenarios, &self.options, cancel).await;
            for (scenario, record) in scenarios.iter().zip(&records) {
                report::print_header(scenario);
                self.report_run(record, &mut tally);
            }
            return Ok(tally);
        }

        for scenario in &scenarios {
            if cancel.is_cancelled() {
                tally.skipped += 1;
                continue;
            }
            report::print_header(scenario);

            let engine = ComparisonEngine::new(self.orchestrator.clone(), self.max_parallel);
            let result = engine
                .compare(scenario, &self.compare, &self.options, cancel.clone())
                .await?;
            for record in result.runs.values() {
                self.report_run(record, &mut tally);
            }
            report::print_diff(&result.diff);
            match self.orchestrator.store().save_comparison(&result) {
                Ok(path) => println!("  {} {}", "comparison:".dimmed(), path.display()),
                Err(e) => tracing::warn!("Comparison not written: {}", e),
            }
        }
        Ok(tally)
    }

    fn report_run(&self, record: &RunRecord, tally: &mut Tally) {
        let dir = self.orchestrator.store().run_dir(&record.scenario_id, &record.run_id);
        report::print_record(record, &dir);
        tally.add(record.state);
    }
}

async fn watch_mode(
    session: Session,
    args: RunArgs,
    validator: Validator,
    debounce_ms: u64,
    shutdown: CancellationToken,
) -> Result<i32> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watched: Vec<PathBuf> = vec![args.scenarios.clone()];
    let _watcher = watch::fs::spawn_watcher(&watched, tx.clone())?;
    let _ = tx.send(WatchEvent::Requested);

    println!(
        "{} {} (Ctrl-C to stop)",
        "Watching".cyan().bold(),
        args.scenarios.display()
    );

    let controller = WatchController::new(Duration::from_millis(debounce_ms));
    let summary = controller
        .run(rx, shutdown, move |changed, cancel| {
            let session = session.clone();
            let args = args.clone();
            async move {
                for path in &changed {
                    println!("\n{} {}", "Changed:".cyan(), path.display());
                }
                // A broken scenario must not end watch mode
                let scenarios = match select(&args, &validator) {
                    Ok(scenarios) => scenarios,
                    Err(e) => {
                        println!("{} {}", "✗".red(), e);
                        return;
                    }
                };
                match session.run_all(scenarios, cancel).await {
                    Ok(tally) => report::print_summary(&tally),
                    Err(e) => println!("{} {}", "✗".red(), e),
                }
            }
        })
        .await;

    println!(
        "\n{} {} run(s), {} cancelled",
        "Watch stopped:".cyan().bold(),
        summary.runs_started,
        summary.runs_cancelled
    );
    Ok(EXIT_PASSED)
}
