//! Step-index alignment of runs

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::orchestrator::{RunRecord, RunState, StepOutcome, StepStatus};

/// Where the runs of a comparison disagree
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Step indices whose outcome differs between versions
    pub divergent_steps: BTreeSet<usize>,
    /// Whether the runs ended in different terminal states
    pub status_divergent: bool,
    pub description: String,
}

/// What is compared per step: status and assertion result
type StepKey = Option<(StepStatus, Option<bool>)>;

fn step_key(step: Option<&StepOutcome>) -> StepKey {
    step.map(|s| (s.status, s.assertion.as_ref().map(|a| a.passed)))
}

fn describe_step(step: Option<&StepOutcome>) -> String {
    match step {
        None => "missing".to_string(),
        Some(s) => match &s.assertion {
            Some(a) if !a.passed => format!("{} (assertion failed)", s.status.as_str()),
            _ => s.status.as_str().to_string(),
        },
    }
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.divergent_steps.is_empty() && !self.status_divergent
    }

    /// Align runs by step index and flag disagreements
    pub fn compute(runs: &BTreeMap<String, RunRecord>) -> Self {
        let longest = runs.values().map(|r| r.steps.len()).max().unwrap_or(0);
        let mut divergent_steps = BTreeSet::new();
        let mut lines = Vec::new();

        for index in 0..longest {
            let keys: HashSet<StepKey> = runs
                .values()
                .map(|r| step_key(r.steps.get(index)))
                .collect();
            if keys.len() > 1 {
                divergent_steps.insert(index);
                let per_run = runs
                    .iter()
                    .map(|(label, r)| format!("{}={}", label, describe_step(r.steps.get(index))))
                    .collect::<Vec<_>>()
                    .join(", ");
                lines.push(format!("step {}: {}", index, per_run));
            }
        }

        let states: HashSet<RunState> = runs.values().map(|r| r.state).collect();
        let status_divergent = states.len() > 1;
        if status_divergent {
            let per_run = runs
                .iter()
                .map(|(label, r)| format!("{}={}", label, r.state.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("result: {}", per_run));
        }

        let description = if lines.is_empty() {
            format!("Identical outcome across {} versions", runs.len())
        } else {
            lines.join("\n")
        };

        Self {
            divergent_steps,
            status_divergent,
            description,
        }
    }
}
