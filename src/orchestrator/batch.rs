//! Multi-scenario batches
//!
//! Every scenario gets its own orchestrator run; a fair semaphore caps how
//! many environments are live at once. Records come back in the order the
//! scenarios were given, whatever order the runs finished in.

use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{Orchestrator, RunOptions, RunRecord};
use crate::scenario::ScenarioDefinition;

/// Runs a set of scenarios with bounded parallelism
pub struct BatchRunner {
    orchestrator: Orchestrator,
    permits: Arc<Semaphore>,
}

impl BatchRunner {
    pub fn new(orchestrator: Orchestrator, max_parallel: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    #[tracing::instrument(skip_all, fields(scenarios = scenarios.len()))]
    pub async fn run(
        &self,
        scenarios: &[ScenarioDefinition],
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Vec<RunRecord> {
        let mut handles = Vec::with_capacity(scenarios.len());

        for scenario in scenarios {
            // The semaphore is never closed, so this only waits
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!("Batch scheduler failed: {}", e);
                    break;
                }
            };

            let orchestrator = self.orchestrator.clone();
            let scenario = scenario.clone();
            let options = options.clone();
            let cancel = cancel.child_token();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                orchestrator.run(&scenario, &options, cancel).await
            }));
        }

        let mut joined = join_all(handles).await.into_iter();
        scenarios
            .iter()
            .map(|scenario| match joined.next() {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    tracing::error!(scenario = %scenario.id, "Batch run crashed: {}", e);
                    self.crashed(scenario, options, e.to_string())
                }
                None => self.crashed(scenario, options, "never scheduled".to_string()),
            })
            .collect()
    }

    fn crashed(&self, scenario: &ScenarioDefinition, options: &RunOptions, reason: String) -> RunRecord {
        let version = options
            .version
            .clone()
            .unwrap_or_else(|| scenario.environment.version.clone());
        self.orchestrator
            .crashed_record(scenario, &version, options, reason)
    }
}
