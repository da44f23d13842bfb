//! Persisted run output
//!
//! ```text
//! <root>/<scenario>/<run_id>/run.json
//! <root>/<scenario>/<run_id>/checkpoint.json    orchestrated runs only
//! <root>/<scenario>/<run_id>/artifacts/
//! <root>/<scenario>/comparison-<timestamp>.json
//! ```

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::compare::ComparisonResult;
use crate::orchestrator::RunRecord;

/// Directory tree run records and artifacts are written to
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, scenario_id: &str, run_id: &str) -> PathBuf {
        self.root.join(scenario_id).join(run_id)
    }

    pub fn artifacts_dir(&self, record: &RunRecord) -> PathBuf {
        self.run_dir(&record.scenario_id, &record.run_id)
            .join("artifacts")
    }

    /// Write the run record
    pub fn save_run(&self, record: &RunRecord) -> Result<PathBuf> {
        let path = self
            .run_dir(&record.scenario_id, &record.run_id)
            .join("run.json");
        write_json_atomic(&path, record)?;
        Ok(path)
    }

    /// Write durable progress of an orchestrated run
    pub fn save_checkpoint(&self, record: &RunRecord) -> Result<PathBuf> {
        let path = self
            .run_dir(&record.scenario_id, &record.run_id)
            .join("checkpoint.json");
        write_json_atomic(&path, record)?;
        Ok(path)
    }

    pub fn save_comparison(&self, result: &ComparisonResult) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = self
            .root
            .join(&result.scenario_id)
            .join(format!("comparison-{}.json", stamp));
        write_json_atomic(&path, result)?;
        Ok(path)
    }

    pub fn load_run(&self, path: &Path) -> Result<RunRecord> {
        let content = fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Delete a run's artifacts that were not explicitly retained, and the
    /// run directory itself once nothing retained is left in it
    pub fn discard(&self, record: &RunRecord) -> Result<()> {
        for artifact in record.artifacts.iter().filter(|a| !a.retained) {
            match fs::remove_file(&artifact.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::file_write(&artifact.path, e)),
            }
        }

        if record.artifacts.iter().any(|a| a.retained) {
            return Ok(());
        }
        let dir = self.run_dir(&record.scenario_id, &record.run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::file_write(&dir, e))?;
        }
        Ok(())
    }
}

/// Write JSON through a temp file and rename, so readers never see a torn file
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| Error::file_write(dir, e))?;

    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| Error::file_write(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::file_write(path, e))?;
    Ok(())
}
