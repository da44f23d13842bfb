//! Human-facing run output

use std::path::Path;

use colored::Colorize;

use crate::common::error::{EXIT_FAILED, EXIT_INFRASTRUCTURE, EXIT_PASSED};
use crate::compare::DiffSummary;
use crate::orchestrator::{RunRecord, RunState, StepStatus};
use crate::scenario::{LoadedScenario, ScenarioDefinition};

/// Terminal states seen during one invocation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl Tally {
    pub fn add(&mut self, state: RunState) {
        match state {
            RunState::Passed => self.passed += 1,
            RunState::Failed => self.failed += 1,
            RunState::Errored => self.errored += 1,
            _ => self.skipped += 1,
        }
    }

    /// Infrastructure problems outrank failures
    pub fn exit_code(&self) -> i32 {
        if self.errored > 0 {
            EXIT_INFRASTRUCTURE
        } else if self.failed > 0 || self.skipped > 0 {
            EXIT_FAILED
        } else {
            EXIT_PASSED
        }
    }
}

pub fn print_header(scenario: &ScenarioDefinition) {
    println!(
        "\n{} {} {}",
        "Running:".blue().bold(),
        scenario.id.white().bold(),
        format!("({})", scenario.title).dimmed()
    );
}

pub fn print_valid(loaded: &LoadedScenario) {
    println!(
        "{} {} {}",
        "✓".green(),
        loaded.scenario.id,
        loaded.path.display().to_string().dimmed()
    );
    for warning in &loaded.warnings {
        println!("    {} {}", "!".yellow(), warning);
    }
}

pub fn print_record(record: &RunRecord, dir: &Path) {
    let environment = record
        .environment
        .as_ref()
        .map(|env| match &env.version {
            Some(version) => format!("{} {}", env.channel, version),
            None => env.channel.to_string(),
        })
        .unwrap_or_else(|| record.requested_version.clone());
    let duration = record
        .duration()
        .map(|d| format!(", {:.1}s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_default();

    let mark = match record.state {
        RunState::Passed => "✓".green().bold(),
        RunState::Failed => "✗".red().bold(),
        RunState::Errored => "!".red().bold(),
        _ => "-".yellow().bold(),
    };
    println!(
        "  {} {} on {}{}",
        mark,
        record.state.as_str().to_uppercase(),
        environment,
        duration.dimmed()
    );

    for step in &record.steps {
        match step.status {
            StepStatus::Succeeded
            | StepStatus::Pending
            | StepStatus::Executing
            | StepStatus::Skipped => {}
            _ => println!(
                "    {} step {} {}: {}",
                "✗".red(),
                step.index,
                step.summary,
                step.error.as_deref().unwrap_or(step.status.as_str())
            ),
        }
    }
    let skipped = record
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Skipped)
        .count();
    if skipped > 0 {
        println!("    {} {} step(s) skipped", "-".yellow(), skipped);
    }
    for check in record.final_checks.iter().filter(|c| !c.passed) {
        let detail = check
            .result
            .as_ref()
            .map(|r| r.mismatches.join("; "))
            .or_else(|| check.error.clone())
            .unwrap_or_default();
        println!("    {} final check {}: {}", "✗".red(), check.target, detail);
    }

    if let Some(verdict) = &record.verdict {
        println!(
            "    verdict {} ({:.0}% confidence, {} judge call(s))",
            verdict.decision.as_str().bold(),
            verdict.confidence * 100.0,
            verdict.invocations
        );
        if !verdict.rationale.is_empty() {
            println!("    {}", verdict.rationale.dimmed());
        }
    }
    if let Some(reason) = &record.reason {
        println!("    {} {}", "reason:".dimmed(), reason);
    }
    for warning in &record.warnings {
        println!("    {} {}", "!".yellow(), warning);
    }
    println!("    {} {}", "output:".dimmed(), dir.display());
}

pub fn print_diff(diff: &DiffSummary) {
    if diff.is_empty() {
        println!("  {} {}", "=".green(), diff.description);
        return;
    }
    println!("  {}", "Versions diverge:".yellow().bold());
    for line in diff.description.lines() {
        println!("    {}", line);
    }
}

pub fn print_summary(tally: &Tally) {
    let total = tally.passed + tally.failed + tally.errored + tally.skipped;
    let headline = if tally.exit_code() == EXIT_PASSED {
        format!("✓ {} of {} passed", tally.passed, total).green().bold()
    } else {
        format!("✗ {} of {} passed", tally.passed, total).red().bold()
    };
    println!(
        "\n{}  ({} failed, {} errored, {} skipped)\n",
        headline, tally.failed, tally.errored, tally.skipped
    );
}
