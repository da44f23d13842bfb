//! Typed interpretation of a step's kind and parameters
//!
//! Steps are stored with a generic parameter map so the file format stays
//! flat. Before anything runs, each step is turned into an `Instruction`,
//! a closed set of variants the orchestrator matches on exhaustively.

use std::time::Duration;

use super::model::{AssertionSpec, Params, Step, StepKind, Target};
use super::validate::IssueKind;

/// What a step does
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Action(ActionInstruction),
    Wait(WaitInstruction),
    Assertion(AssertionSpec),
}

/// UI actions forwarded to the automation driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionInstruction {
    Click,
    DoubleClick,
    Type { text: String },
    Press { key: String },
    RunCommand { command: String },
    OpenFile { path: String },
    Hover,
    Focus,
}

impl ActionInstruction {
    pub const VERBS: &'static [&'static str] = &[
        "click",
        "double_click",
        "type",
        "press",
        "run_command",
        "open_file",
        "hover",
        "focus",
    ];

    /// Wire name of the action
    pub fn verb(&self) -> &'static str {
        match self {
            ActionInstruction::Click => "click",
            ActionInstruction::DoubleClick => "double_click",
            ActionInstruction::Type { .. } => "type",
            ActionInstruction::Press { .. } => "press",
            ActionInstruction::RunCommand { .. } => "run_command",
            ActionInstruction::OpenFile { .. } => "open_file",
            ActionInstruction::Hover => "hover",
            ActionInstruction::Focus => "focus",
        }
    }

    fn needs_target(&self) -> bool {
        matches!(
            self,
            ActionInstruction::Click
                | ActionInstruction::DoubleClick
                | ActionInstruction::Hover
                | ActionInstruction::Focus
        )
    }
}

/// Element state a wait step blocks on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Visible,
    Hidden,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
        }
    }
}

/// Wait step behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitInstruction {
    /// Wait until the step target reaches a state
    Element { state: WaitState },
    /// Fixed pause, for animations the driver cannot observe
    Pause { duration: Duration },
}

/// A problem with one parameter of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamProblem {
    /// Field relative to the step, e.g. `params.action` or `target`
    pub field: String,
    pub kind: IssueKind,
}

impl ParamProblem {
    fn new(field: impl Into<String>, kind: IssueKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }
}

/// Parameters each instruction reads; anything else is unused
fn known_params(step: &Step) -> &'static [&'static str] {
    match step.kind {
        StepKind::Action => &["action", "text", "key", "command", "path"],
        StepKind::Wait => &["state", "duration_ms"],
        StepKind::Assertion => AssertionSpec::FIELDS,
    }
}

/// Parameters present on the step that its kind never reads
pub fn unused_params(step: &Step) -> Vec<String> {
    let known = known_params(step);
    step.params
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .cloned()
        .collect()
}

/// Interpret a step, reporting every parameter problem at once
pub fn interpret(step: &Step) -> Result<Instruction, Vec<ParamProblem>> {
    let mut problems = Vec::new();
    let instruction = match step.kind {
        StepKind::Action => interpret_action(step, &mut problems).map(Instruction::Action),
        StepKind::Wait => interpret_wait(step, &mut problems).map(Instruction::Wait),
        StepKind::Assertion => {
            interpret_assertion(step.target.as_ref(), &step.params, "params.", &mut problems)
                .map(Instruction::Assertion)
        }
    };

    match instruction {
        Some(instruction) if problems.is_empty() => Ok(instruction),
        _ => Err(problems),
    }
}

fn interpret_action(step: &Step, problems: &mut Vec<ParamProblem>) -> Option<ActionInstruction> {
    let verb = required_string(&step.params, "action", problems)?;
    let action = match verb.as_str() {
        "click" => ActionInstruction::Click,
        "double_click" => ActionInstruction::DoubleClick,
        "hover" => ActionInstruction::Hover,
        "focus" => ActionInstruction::Focus,
        "type" => ActionInstruction::Type {
            text: required_string(&step.params, "text", problems)?,
        },
        "press" => ActionInstruction::Press {
            key: required_string(&step.params, "key", problems)?,
        },
        "run_command" => ActionInstruction::RunCommand {
            command: required_string(&step.params, "command", problems)?,
        },
        "open_file" => ActionInstruction::OpenFile {
            path: required_string(&step.params, "path", problems)?,
        },
        other => {
            problems.push(ParamProblem::new(
                "params.action",
                IssueKind::Unknown {
                    value: other.to_string(),
                    allowed: ActionInstruction::VERBS.join(", "),
                },
            ));
            return None;
        }
    };

    if action.needs_target() && step.target.is_none() {
        problems.push(ParamProblem::new("target", IssueKind::Missing));
        return None;
    }
    Some(action)
}

fn interpret_wait(step: &Step, problems: &mut Vec<ParamProblem>) -> Option<WaitInstruction> {
    if step.target.is_some() {
        let state = match step.params.get("state") {
            None => WaitState::Visible,
            Some(value) => match value.as_str() {
                Some("visible") => WaitState::Visible,
                Some("hidden") => WaitState::Hidden,
                Some(other) => {
                    problems.push(ParamProblem::new(
                        "params.state",
                        IssueKind::Unknown {
                            value: other.to_string(),
                            allowed: "visible, hidden".to_string(),
                        },
                    ));
                    return None;
                }
                None => {
                    problems.push(ParamProblem::new(
                        "params.state",
                        IssueKind::WrongType { expected: "string" },
                    ));
                    return None;
                }
            },
        };
        return Some(WaitInstruction::Element { state });
    }

    match step.params.get("duration_ms") {
        None => {
            problems.push(ParamProblem::new("params.duration_ms", IssueKind::Missing));
            None
        }
        Some(value) => match value.as_i64() {
            Some(ms) if ms > 0 => Some(WaitInstruction::Pause {
                duration: Duration::from_millis(ms as u64),
            }),
            Some(_) => {
                problems.push(ParamProblem::new(
                    "params.duration_ms",
                    IssueKind::NotPositive,
                ));
                None
            }
            None => {
                problems.push(ParamProblem::new(
                    "params.duration_ms",
                    IssueKind::WrongType {
                        expected: "integer",
                    },
                ));
                None
            }
        },
    }
}

/// Interpret assertion fields from a parameter map
///
/// Shared by assertion steps (`prefix` = `params.`) and final-state checks.
pub fn interpret_assertion(
    target: Option<&Target>,
    params: &Params,
    prefix: &str,
    problems: &mut Vec<ParamProblem>,
) -> Option<AssertionSpec> {
    let before = problems.len();

    if target.is_none() {
        problems.push(ParamProblem::new("target", IssueKind::Missing));
    }

    let mut spec = AssertionSpec::default();

    if let Some(value) = params.get("visible") {
        match value.as_bool() {
            Some(b) => spec.visible = Some(b),
            None => problems.push(ParamProblem::new(
                format!("{prefix}visible"),
                IssueKind::WrongType { expected: "boolean" },
            )),
        }
    }
    for (field, slot) in [
        ("text_equals", &mut spec.text_equals),
        ("text_contains", &mut spec.text_contains),
    ] {
        if let Some(value) = params.get(field) {
            match value.as_str() {
                Some(s) => *slot = Some(s.to_string()),
                None => problems.push(ParamProblem::new(
                    format!("{prefix}{field}"),
                    IssueKind::WrongType { expected: "string" },
                )),
            }
        }
    }
    if let Some(value) = params.get("count") {
        match value.as_u64() {
            Some(n) => spec.count = Some(n as usize),
            None => problems.push(ParamProblem::new(
                format!("{prefix}count"),
                IssueKind::WrongType {
                    expected: "non-negative integer",
                },
            )),
        }
    }

    if problems.len() == before && spec.is_empty() {
        problems.push(ParamProblem::new(
            prefix.trim_end_matches('.').to_string(),
            IssueKind::Malformed(format!(
                "needs at least one of: {}",
                AssertionSpec::FIELDS.join(", ")
            )),
        ));
    }

    (problems.len() == before).then_some(spec)
}

fn required_string(
    params: &Params,
    key: &str,
    problems: &mut Vec<ParamProblem>,
) -> Option<String> {
    match params.get(key) {
        None => {
            problems.push(ParamProblem::new(format!("params.{key}"), IssueKind::Missing));
            None
        }
        Some(value) => match value.as_str() {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            Some(_) => {
                problems.push(ParamProblem::new(format!("params.{key}"), IssueKind::Empty));
                None
            }
            None => {
                problems.push(ParamProblem::new(
                    format!("params.{key}"),
                    IssueKind::WrongType { expected: "string" },
                ));
                None
            }
        },
    }
}
