//! Scenario discovery
//!
//! Finds scenario files under a directory, validates each one and indexes
//! them by identifier.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::model::ScenarioDefinition;
use super::validate::{ValidationIssue, Validator};
use crate::common::{paths, Error, Result};

/// A validated scenario and the file it came from
#[derive(Debug, Clone)]
pub struct LoadedScenario {
    pub path: PathBuf,
    pub scenario: ScenarioDefinition,
    pub warnings: Vec<ValidationIssue>,
}

/// Every scenario file under a directory
#[derive(Debug, Default)]
pub struct ScenarioSet {
    by_id: BTreeMap<String, LoadedScenario>,
}

impl ScenarioSet {
    /// Load and validate every `*.yaml`/`*.yml` file under `dir`
    ///
    /// Fails on the first invalid file with its complete issue list, and on
    /// duplicate identifiers.
    pub fn load_dir(dir: &Path, validator: &Validator) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "Scenario directory '{}' does not exist. Pass --scenarios <dir>",
                dir.display()
            )));
        }

        let mut set = Self::default();
        for path in scenario_files(dir) {
            set.insert(load_file(&path, validator)?)?;
        }

        tracing::debug!(dir = %dir.display(), count = set.len(), "Loaded scenarios");
        Ok(set)
    }

    fn insert(&mut self, loaded: LoadedScenario) -> Result<()> {
        if let Some(existing) = self.by_id.get(&loaded.scenario.id) {
            return Err(Error::DuplicateScenario {
                id: loaded.scenario.id.clone(),
                first: existing.path.display().to_string(),
                second: loaded.path.display().to_string(),
            });
        }
        self.by_id.insert(loaded.scenario.id.clone(), loaded);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&LoadedScenario> {
        self.by_id.get(id)
    }

    /// All scenarios in identifier order
    pub fn iter(&self) -> impl Iterator<Item = &LoadedScenario> {
        self.by_id.values()
    }

    /// Select scenarios by id, or all (optionally filtered by tag)
    pub fn select(&self, id: Option<&str>, tag: Option<&str>) -> Result<Vec<&LoadedScenario>> {
        if let Some(id) = id {
            let loaded = self
                .get(id)
                .ok_or_else(|| Error::ScenarioNotFound(id.to_string()))?;
            return Ok(vec![loaded]);
        }
        Ok(self
            .iter()
            .filter(|l| tag.map_or(true, |t| l.scenario.has_tag(t)))
            .collect())
    }
}

/// Scenario files under `dir`, sorted
pub fn scenario_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && paths::is_scenario_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Read and validate one scenario file
pub fn load_file(path: &Path, validator: &Validator) -> Result<LoadedScenario> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
    let validated = validator
        .validate_str(&content)
        .map_err(|issues| Error::Validation {
            source_name: path.display().to_string(),
            issues,
        })?;
    Ok(LoadedScenario {
        path: path.to_path_buf(),
        scenario: validated.scenario,
        warnings: validated.warnings,
    })
}
