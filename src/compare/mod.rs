//! Cross-version comparison
//!
//! One orchestrator run per requested version, each an independent failure
//! domain. A fair semaphore bounds how many environments exist at once;
//! permits are taken in submission order before a run is spawned, so queued
//! versions start in the order they were requested.

mod diff;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{Orchestrator, RunOptions, RunRecord};
use crate::scenario::{ScenarioDefinition, VersionSpec};

pub use diff::DiffSummary;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComparisonError {
    #[error("A comparison needs at least two runs, got {0}")]
    TooFewRuns(usize),

    #[error("Version '{0}' was requested more than once")]
    DuplicateVersion(String),

    #[error("Comparison scheduler failed: {0}")]
    Scheduler(String),
}

/// Runs of one scenario across versions, aligned by step index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub scenario_id: String,
    /// Run per version label
    pub runs: BTreeMap<String, RunRecord>,
    pub diff: DiffSummary,
}

impl ComparisonResult {
    /// Build a result from labelled runs; needs at least two
    pub fn new(
        scenario_id: impl Into<String>,
        runs: impl IntoIterator<Item = (String, RunRecord)>,
    ) -> Result<Self, ComparisonError> {
        let mut by_label = BTreeMap::new();
        for (label, record) in runs {
            if by_label.insert(label.clone(), record).is_some() {
                return Err(ComparisonError::DuplicateVersion(label));
            }
        }
        if by_label.len() < 2 {
            return Err(ComparisonError::TooFewRuns(by_label.len()));
        }

        let diff = DiffSummary::compute(&by_label);
        Ok(Self {
            scenario_id: scenario_id.into(),
            runs: by_label,
            diff,
        })
    }

    /// Whether every version behaved the same
    pub fn is_consistent(&self) -> bool {
        self.diff.is_empty()
    }
}

/// Runs a scenario against several versions with bounded parallelism
pub struct ComparisonEngine {
    orchestrator: Orchestrator,
    permits: Arc<Semaphore>,
}

impl ComparisonEngine {
    pub fn new(orchestrator: Orchestrator, max_parallel: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    #[tracing::instrument(skip_all, fields(scenario = %scenario.id, versions = versions.len()))]
    pub async fn compare(
        &self,
        scenario: &ScenarioDefinition,
        versions: &[VersionSpec],
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<ComparisonResult, ComparisonError> {
        if versions.len() < 2 {
            return Err(ComparisonError::TooFewRuns(versions.len()));
        }
        let mut labels = Vec::with_capacity(versions.len());
        for version in versions {
            let label = version.to_string();
            if labels.contains(&label) {
                return Err(ComparisonError::DuplicateVersion(label));
            }
            labels.push(label);
        }

        let scenario = Arc::new(scenario.clone());
        let mut pending = Vec::with_capacity(versions.len());

        for (label, version) in labels.into_iter().zip(versions) {
            // Waiting here keeps later versions queued behind earlier ones
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ComparisonError::Scheduler(e.to_string()))?;
            tracing::debug!(version = %label, "Starting comparison run");

            let orchestrator = self.orchestrator.clone();
            let scenario = scenario.clone();
            let options = RunOptions {
                version: Some(version.clone()),
                ..options.clone()
            };
            let cancel = cancel.child_token();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                orchestrator.run(&scenario, &options, cancel).await
            });
            pending.push((label, version.clone(), handle));
        }

        let (queued, handles): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .map(|(label, version, handle)| ((label, version), handle))
            .unzip();
        let joined = join_all(handles).await;

        let mut runs = Vec::with_capacity(queued.len());
        for ((label, version), joined) in queued.into_iter().zip(joined) {
            let record = match joined {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(version = %label, "Comparison run crashed: {}", e);
                    self.orchestrator
                        .crashed_record(&scenario, &version, options, e.to_string())
                }
            };
            runs.push((label, record));
        }

        let result = ComparisonResult::new(scenario.id.clone(), runs)?;
        tracing::info!(
            divergent_steps = result.diff.divergent_steps.len(),
            "Comparison finished"
        );
        Ok(result)
    }
}
