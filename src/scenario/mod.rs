//! Scenario model, validation and discovery
//!
//! Scenarios are YAML files describing one user interaction with the editor:
//! an ordered list of action, wait and assertion steps plus the expected
//! outcome the judge grades against.

mod instruction;
mod loader;
mod model;
mod validate;

pub use instruction::{
    interpret, interpret_assertion, unused_params, ActionInstruction, Instruction, ParamProblem,
    WaitInstruction, WaitState,
};
pub use loader::{load_file, scenario_files, LoadedScenario, ScenarioSet};
pub use model::*;
pub use validate::{IssueKind, Severity, Validated, ValidationIssue, Validator};
