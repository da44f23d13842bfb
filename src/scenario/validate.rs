//! Scenario validation
//!
//! Validation is a pure function of the input text. The YAML is first read
//! as an untyped document and then walked field by field, so one pass
//! reports every violation instead of stopping at the first serde error.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use super::instruction::{self, interpret_assertion};
use super::model::{
    Channel, EnvironmentRequirements, ExpectedOutcome, OutcomeAssertion, Params, Priority,
    ScenarioDefinition, Step, StepKind, Tag, Target, Timeouts, VersionSpec,
};

const TOP_LEVEL_KEYS: &[&str] = &[
    "id",
    "title",
    "description",
    "tags",
    "priority",
    "owner",
    "environment",
    "timeouts",
    "steps",
    "expectedOutcome",
];
const ENVIRONMENT_KEYS: &[&str] = &["version", "profile", "workspace"];
const TIMEOUT_KEYS: &[&str] = &["step", "scenario"];
const STEP_KEYS: &[&str] = &["name", "kind", "target", "params", "timeout", "blocking"];
const OUTCOME_KEYS: &[&str] = &["description", "assertions"];

/// Severity of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

/// What is wrong with a field
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueKind {
    Syntax(String),
    Missing,
    Empty,
    WrongType { expected: &'static str },
    Unknown { value: String, allowed: String },
    NotPositive,
    Malformed(String),
    DuplicateTag(String),
    UnknownField,
    UnusedParam,
    Recommended,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::Syntax(e) => write!(f, "YAML syntax error: {}", e),
            IssueKind::Missing => write!(f, "is required"),
            IssueKind::Empty => write!(f, "must not be empty"),
            IssueKind::WrongType { expected } => write!(f, "must be a {}", expected),
            IssueKind::Unknown { value, allowed } => {
                write!(f, "unknown value '{}' (expected one of: {})", value, allowed)
            }
            IssueKind::NotPositive => write!(f, "must be greater than zero"),
            IssueKind::Malformed(reason) => write!(f, "{}", reason),
            IssueKind::DuplicateTag(tag) => write!(f, "tag '{}' is listed more than once", tag),
            IssueKind::UnknownField => write!(f, "is not a recognized field"),
            IssueKind::UnusedParam => write!(f, "is not used by this step kind"),
            IssueKind::Recommended => write!(f, "is recommended"),
        }
    }
}

/// A single validation finding, addressed by field path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValidationIssue {
    /// Field path such as `steps[2].params.action`
    pub path: String,
    pub kind: IssueKind,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(path: impl Into<String>, kind: IssueKind) -> Self {
        Self {
            path: path.into(),
            kind,
            severity: Severity::Error,
        }
    }

    pub fn warning(path: impl Into<String>, kind: IssueKind) -> Self {
        Self {
            path: path.into(),
            kind,
            severity: Severity::Warning,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "{}: {}", self.path, self.kind),
            Severity::Warning => write!(f, "{}: {} (warning)", self.path, self.kind),
        }
    }
}

/// A scenario that passed validation, with any non-fatal findings
#[derive(Debug, Clone)]
pub struct Validated {
    pub scenario: ScenarioDefinition,
    pub warnings: Vec<ValidationIssue>,
}

/// Scenario validator
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    strict: bool,
}

impl Validator {
    /// Create a validator; strict mode promotes warnings to errors
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Validate raw scenario text
    pub fn validate_str(&self, raw: &str) -> Result<Validated, Vec<ValidationIssue>> {
        let value: Value = serde_yaml::from_str(raw).map_err(|e| {
            vec![ValidationIssue::error(
                "$",
                IssueKind::Syntax(e.to_string()),
            )]
        })?;
        self.validate_value(&value)
    }

    /// Validate an already-parsed YAML document
    pub fn validate_value(&self, value: &Value) -> Result<Validated, Vec<ValidationIssue>> {
        let mut cx = Collector::default();
        let scenario = build_scenario(value, &mut cx);
        cx.finish(self.strict, scenario)
    }
}

#[derive(Default)]
struct Collector {
    issues: Vec<ValidationIssue>,
}

impl Collector {
    fn error(&mut self, path: impl Into<String>, kind: IssueKind) {
        self.issues.push(ValidationIssue::error(path, kind));
    }

    fn warn(&mut self, path: impl Into<String>, kind: IssueKind) {
        self.issues.push(ValidationIssue::warning(path, kind));
    }

    fn finish(
        self,
        strict: bool,
        scenario: Option<ScenarioDefinition>,
    ) -> Result<Validated, Vec<ValidationIssue>> {
        let mut issues: Vec<ValidationIssue> = self
            .issues
            .into_iter()
            .map(|mut issue| {
                if strict {
                    issue.severity = Severity::Error;
                }
                issue
            })
            .collect();
        issues.sort();
        issues.dedup();

        let (errors, warnings): (Vec<_>, Vec<_>) = issues
            .into_iter()
            .partition(|i| i.severity == Severity::Error);

        match scenario {
            Some(scenario) if errors.is_empty() => Ok(Validated { scenario, warnings }),
            _ => Err(errors),
        }
    }
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn check_known_keys(map: &Mapping, path: &str, known: &[&str], cx: &mut Collector) {
    for key in map.keys() {
        match key.as_str() {
            Some(k) if known.contains(&k) => {}
            Some(k) => cx.warn(join(path, k), IssueKind::UnknownField),
            None => cx.error(
                path.to_string(),
                IssueKind::Malformed("field names must be strings".to_string()),
            ),
        }
    }
}

fn as_mapping<'a>(value: &'a Value, path: &str, cx: &mut Collector) -> Option<&'a Mapping> {
    match value.as_mapping() {
        Some(map) => Some(map),
        None => {
            cx.error(path, IssueKind::WrongType { expected: "mapping" });
            None
        }
    }
}

fn required_str(map: &Mapping, key: &str, path: &str, cx: &mut Collector) -> Option<String> {
    let path = join(path, key);
    match map.get(key) {
        None | Some(Value::Null) => {
            cx.error(path, IssueKind::Missing);
            None
        }
        Some(value) => string_value(value, &path, cx),
    }
}

fn optional_str(map: &Mapping, key: &str, path: &str, cx: &mut Collector) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(value) => string_value(value, &join(path, key), cx),
    }
}

fn string_value(value: &Value, path: &str, cx: &mut Collector) -> Option<String> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Some(s.to_string()),
        Some(_) => {
            cx.error(path, IssueKind::Empty);
            None
        }
        None => {
            cx.error(path, IssueKind::WrongType { expected: "string" });
            None
        }
    }
}

fn positive_int(value: &Value, path: &str, cx: &mut Collector) -> Option<u64> {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(v), _) if v > 0 => Some(v as u64),
            (Some(_), _) => {
                cx.error(path, IssueKind::NotPositive);
                None
            }
            (None, Some(v)) => Some(v),
            (None, None) if n.as_f64().map(|f| f <= 0.0).unwrap_or(false) => {
                cx.error(path, IssueKind::NotPositive);
                None
            }
            (None, None) => {
                cx.error(path, IssueKind::WrongType { expected: "integer" });
                None
            }
        },
        _ => {
            cx.error(path, IssueKind::WrongType { expected: "integer" });
            None
        }
    }
}

fn check_identifier(id: &str, cx: &mut Collector) -> bool {
    let mut chars = id.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let rest_ok = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' || c == '.'
    });
    if first_ok && rest_ok {
        true
    } else {
        cx.error(
            "id",
            IssueKind::Malformed(
                "must start with a lowercase letter or digit and contain only lowercase letters, digits, '-', '_' or '.'"
                    .to_string(),
            ),
        );
        false
    }
}

fn build_scenario(value: &Value, cx: &mut Collector) -> Option<ScenarioDefinition> {
    let map = as_mapping(value, "$", cx)?;
    check_known_keys(map, "", TOP_LEVEL_KEYS, cx);

    let id = required_str(map, "id", "", cx).filter(|id| check_identifier(id, cx));
    let title = required_str(map, "title", "", cx);

    let description = optional_str(map, "description", "", cx);
    if description.is_none() && !map.contains_key("description") {
        cx.warn("description", IssueKind::Recommended);
    }

    let owner = optional_str(map, "owner", "", cx);
    if owner.is_none() && !map.contains_key("owner") {
        cx.warn("owner", IssueKind::Recommended);
    }

    let tags = parse_tags(map.get("tags"), cx);
    let priority = parse_priority(map.get("priority"), cx);
    let environment = parse_environment(map.get("environment"), cx);
    let timeouts = parse_timeouts(map.get("timeouts"), cx);
    let steps = parse_steps(map.get("steps"), cx);
    let expected_outcome = parse_expected(map.get("expectedOutcome"), cx);

    Some(ScenarioDefinition {
        id: id?,
        title: title?,
        description: description.unwrap_or_default(),
        tags: tags?,
        priority: priority?,
        owner,
        environment: environment?,
        timeouts: timeouts?,
        steps: steps?,
        expected_outcome: expected_outcome?,
    })
}

fn parse_tags(value: Option<&Value>, cx: &mut Collector) -> Option<BTreeSet<Tag>> {
    let mut tags = BTreeSet::new();
    let Some(value) = value.filter(|v| !v.is_null()) else {
        cx.warn("tags", IssueKind::Recommended);
        return Some(tags);
    };
    let Some(items) = value.as_sequence() else {
        cx.error("tags", IssueKind::WrongType { expected: "list" });
        return None;
    };
    if items.is_empty() {
        cx.warn("tags", IssueKind::Recommended);
    }

    let mut ok = true;
    for (i, item) in items.iter().enumerate() {
        let path = format!("tags[{}]", i);
        let Some(name) = string_value(item, &path, cx) else {
            ok = false;
            continue;
        };
        match Tag::parse(&name) {
            Some(tag) => {
                if !tags.insert(tag) {
                    cx.warn(path, IssueKind::DuplicateTag(name));
                }
            }
            None => {
                ok = false;
                cx.error(
                    path,
                    IssueKind::Unknown {
                        value: name,
                        allowed: Tag::allowed(),
                    },
                );
            }
        }
    }
    ok.then_some(tags)
}

fn parse_priority(value: Option<&Value>, cx: &mut Collector) -> Option<Priority> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        cx.error("priority", IssueKind::Missing);
        return None;
    };
    let raw = string_value(value, "priority", cx)?;
    match raw.parse::<Priority>() {
        Ok(priority) => Some(priority),
        Err(()) => {
            cx.error(
                "priority",
                IssueKind::Unknown {
                    value: raw,
                    allowed: Priority::ALL.join(", "),
                },
            );
            None
        }
    }
}

fn parse_environment(value: Option<&Value>, cx: &mut Collector) -> Option<EnvironmentRequirements> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Some(EnvironmentRequirements::default());
    };
    let map = as_mapping(value, "environment", cx)?;
    check_known_keys(map, "environment", ENVIRONMENT_KEYS, cx);

    let version = match optional_str(map, "version", "environment", cx) {
        None if map.get("version").map_or(false, |v| !v.is_null()) => None,
        None => Some(VersionSpec::channel(Channel::Stable)),
        Some(raw) => match raw.parse::<VersionSpec>() {
            Ok(spec) => Some(spec),
            Err(reason) => {
                let kind = if raw.contains('@') {
                    IssueKind::Malformed(reason)
                } else {
                    IssueKind::Unknown {
                        value: raw,
                        allowed: Channel::ALL.join(", "),
                    }
                };
                cx.error("environment.version", kind);
                None
            }
        },
    };

    let mut ok = true;
    let profile = optional_str(map, "profile", "environment", cx);
    if let Some(name) = &profile {
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !name.starts_with('.');
        if !valid {
            ok = false;
            cx.error(
                "environment.profile",
                IssueKind::Malformed(
                    "profile names may only contain letters, digits, '-', '_' and '.'".to_string(),
                ),
            );
        }
    } else if map.get("profile").map_or(false, |v| !v.is_null()) {
        ok = false;
    }

    let workspace = optional_str(map, "workspace", "environment", cx);
    if let Some(path) = &workspace {
        if path.contains('\0') || path.contains('\n') || path != path.trim() {
            ok = false;
            cx.error(
                "environment.workspace",
                IssueKind::Malformed(
                    "workspace path contains control characters or surrounding whitespace"
                        .to_string(),
                ),
            );
        }
    } else if map.get("workspace").map_or(false, |v| !v.is_null()) {
        ok = false;
    }

    if !ok {
        return None;
    }
    Some(EnvironmentRequirements {
        version: version?,
        profile,
        workspace: workspace.map(PathBuf::from),
    })
}

fn parse_timeouts(value: Option<&Value>, cx: &mut Collector) -> Option<Timeouts> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Some(Timeouts::default());
    };
    let map = as_mapping(value, "timeouts", cx)?;
    check_known_keys(map, "timeouts", TIMEOUT_KEYS, cx);

    let mut ok = true;
    let mut read = |key: &str, cx: &mut Collector| -> Option<u64> {
        let v = map.get(key)?;
        let parsed = positive_int(v, &join("timeouts", key), cx);
        if parsed.is_none() {
            ok = false;
        }
        parsed
    };
    let step_ms = read("step", cx);
    let scenario_ms = read("scenario", cx);

    ok.then_some(Timeouts {
        step_ms,
        scenario_ms,
    })
}

fn parse_target(value: &Value, path: &str, cx: &mut Collector) -> Option<Target> {
    if let Some(selector) = value.as_str() {
        return string_value(value, path, cx).map(|_| Target::Selector(selector.to_string()));
    }
    let map = as_mapping(value, path, cx)?;
    match (map.get("selector"), map.get("description")) {
        (Some(_), Some(_)) => {
            cx.error(
                path,
                IssueKind::Malformed("use either 'selector' or 'description', not both".into()),
            );
            None
        }
        (Some(s), None) => string_value(s, &join(path, "selector"), cx).map(Target::Selector),
        (None, Some(d)) => string_value(d, &join(path, "description"), cx).map(Target::Semantic),
        (None, None) => {
            cx.error(
                path,
                IssueKind::Malformed("needs a 'selector' or a 'description'".into()),
            );
            None
        }
    }
}

fn parse_params(value: Option<&Value>, path: &str, cx: &mut Collector) -> Option<Params> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Some(Params::new());
    };
    as_mapping(value, path, cx)?;
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Some(map.into_iter().collect()),
        Ok(_) => {
            cx.error(path, IssueKind::WrongType { expected: "mapping" });
            None
        }
        Err(e) => {
            cx.error(path, IssueKind::Malformed(e.to_string()));
            None
        }
    }
}

fn parse_steps(value: Option<&Value>, cx: &mut Collector) -> Option<Vec<Step>> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        cx.error("steps", IssueKind::Missing);
        return None;
    };
    let Some(items) = value.as_sequence() else {
        cx.error("steps", IssueKind::WrongType { expected: "list" });
        return None;
    };
    if items.is_empty() {
        cx.error("steps", IssueKind::Empty);
        return None;
    }

    let mut steps = Vec::with_capacity(items.len());
    let mut ok = true;
    for (i, item) in items.iter().enumerate() {
        match parse_step(item, &format!("steps[{}]", i), cx) {
            Some(step) => steps.push(step),
            None => ok = false,
        }
    }
    ok.then_some(steps)
}

fn parse_step(value: &Value, path: &str, cx: &mut Collector) -> Option<Step> {
    let map = as_mapping(value, path, cx)?;
    check_known_keys(map, path, STEP_KEYS, cx);

    let name = optional_str(map, "name", path, cx);
    let kind = required_str(map, "kind", path, cx).and_then(|raw| match raw.parse::<StepKind>() {
        Ok(kind) => Some(kind),
        Err(()) => {
            cx.error(
                join(path, "kind"),
                IssueKind::Unknown {
                    value: raw,
                    allowed: StepKind::ALL.join(", "),
                },
            );
            None
        }
    });

    let mut ok = true;
    let target = match map.get("target").filter(|v| !v.is_null()) {
        None => None,
        Some(v) => {
            let parsed = parse_target(v, &join(path, "target"), cx);
            ok &= parsed.is_some();
            parsed
        }
    };
    let params = parse_params(map.get("params"), &join(path, "params"), cx);
    let timeout = match map.get("timeout").filter(|v| !v.is_null()) {
        None => None,
        Some(v) => {
            let parsed = positive_int(v, &join(path, "timeout"), cx);
            ok &= parsed.is_some();
            parsed
        }
    };
    let blocking = match map.get("blocking") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            ok = false;
            cx.error(join(path, "blocking"), IssueKind::WrongType { expected: "boolean" });
            true
        }
    };

    let step = Step {
        name,
        kind: kind?,
        target,
        params: params?,
        timeout,
        blocking,
    };
    if !ok {
        return None;
    }

    for unused in instruction::unused_params(&step) {
        cx.warn(format!("{}.params.{}", path, unused), IssueKind::UnusedParam);
    }
    match instruction::interpret(&step) {
        Ok(_) => Some(step),
        Err(problems) => {
            for problem in problems {
                cx.error(join(path, &problem.field), problem.kind);
            }
            None
        }
    }
}

fn parse_expected(value: Option<&Value>, cx: &mut Collector) -> Option<ExpectedOutcome> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        cx.error("expectedOutcome", IssueKind::Missing);
        return None;
    };
    if value.is_string() {
        return string_value(value, "expectedOutcome", cx).map(|description| ExpectedOutcome {
            description,
            assertions: Vec::new(),
        });
    }

    let map = as_mapping(value, "expectedOutcome", cx)?;
    check_known_keys(map, "expectedOutcome", OUTCOME_KEYS, cx);
    let description = required_str(map, "description", "expectedOutcome", cx);

    let mut assertions = Vec::new();
    let mut ok = true;
    if let Some(items) = map.get("assertions").filter(|v| !v.is_null()) {
        match items.as_sequence() {
            None => {
                ok = false;
                cx.error(
                    "expectedOutcome.assertions",
                    IssueKind::WrongType { expected: "list" },
                );
            }
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let path = format!("expectedOutcome.assertions[{}]", i);
                    match parse_outcome_assertion(item, &path, cx) {
                        Some(a) => assertions.push(a),
                        None => ok = false,
                    }
                }
            }
        }
    }

    let description = description?;
    ok.then_some(ExpectedOutcome {
        description,
        assertions,
    })
}

fn parse_outcome_assertion(value: &Value, path: &str, cx: &mut Collector) -> Option<OutcomeAssertion> {
    let map = as_mapping(value, path, cx)?;
    let mut known = vec!["target"];
    known.extend_from_slice(super::model::AssertionSpec::FIELDS);
    check_known_keys(map, path, &known, cx);

    let target = match map.get("target").filter(|v| !v.is_null()) {
        Some(v) => Some(parse_target(v, &join(path, "target"), cx)?),
        None => None,
    };

    let mut fields = map.clone();
    fields.remove("target");
    let params = parse_params(Some(&Value::Mapping(fields)), path, cx)?;

    let mut problems = Vec::new();
    let spec = interpret_assertion(target.as_ref(), &params, "", &mut problems);
    for problem in problems {
        let field = if problem.field.is_empty() {
            path.to_string()
        } else {
            join(path, &problem.field)
        };
        cx.error(field, problem.kind);
    }
    Some(OutcomeAssertion {
        target: target?,
        expect: spec?,
    })
}
