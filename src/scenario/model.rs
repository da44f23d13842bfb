//! Scenario definition types
//!
//! These types serialize to exactly the scenario file schema, so a
//! definition written back out validates to an equal definition.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// A complete, validated scenario
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDefinition {
    /// Stable identifier, unique across the scenario directory
    pub id: String,
    /// Short human-readable title
    pub title: String,
    /// Free-text description of what the scenario exercises
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Tags from the closed tag set
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<Tag>,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Where the scenario must run
    pub environment: EnvironmentRequirements,
    /// Scenario-level timeout defaults
    #[serde(skip_serializing_if = "Timeouts::is_unset")]
    pub timeouts: Timeouts,
    /// Ordered, non-empty step sequence
    pub steps: Vec<Step>,
    pub expected_outcome: ExpectedOutcome,
}

impl ScenarioDefinition {
    /// Effective timeout of a step, inheriting the scenario default and then
    /// the engine default
    pub fn step_timeout(&self, index: usize, engine_default: Duration) -> Duration {
        self.steps
            .get(index)
            .and_then(|s| s.timeout)
            .or(self.timeouts.step_ms)
            .map(Duration::from_millis)
            .unwrap_or(engine_default)
    }

    /// Sum of every step timeout, the worst-case running time
    pub fn worst_case_duration(&self, engine_default: Duration) -> Duration {
        (0..self.steps.len())
            .map(|i| self.step_timeout(i, engine_default))
            .sum()
    }

    /// Whether the scenario carries a tag with the given name
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.as_str() == name)
    }
}

/// Scenario priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Priority {
    pub const ALL: &'static [&'static str] = &["P0", "P1", "P2"];
}

impl FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            _ => Err(()),
        }
    }
}

/// Closed set of scenario tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tag {
    Smoke,
    Regression,
    Editor,
    Terminal,
    Chat,
    Search,
    Extensions,
    Settings,
    Git,
    Debug,
    Notebook,
    Accessibility,
    Performance,
}

impl Tag {
    pub const ALL: &'static [Tag] = &[
        Tag::Smoke,
        Tag::Regression,
        Tag::Editor,
        Tag::Terminal,
        Tag::Chat,
        Tag::Search,
        Tag::Extensions,
        Tag::Settings,
        Tag::Git,
        Tag::Debug,
        Tag::Notebook,
        Tag::Accessibility,
        Tag::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Smoke => "smoke",
            Tag::Regression => "regression",
            Tag::Editor => "editor",
            Tag::Terminal => "terminal",
            Tag::Chat => "chat",
            Tag::Search => "search",
            Tag::Extensions => "extensions",
            Tag::Settings => "settings",
            Tag::Git => "git",
            Tag::Debug => "debug",
            Tag::Notebook => "notebook",
            Tag::Accessibility => "accessibility",
            Tag::Performance => "performance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Comma-separated list of every valid tag
    pub fn allowed() -> String {
        Self::ALL
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Editor release channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stable,
    Insiders,
}

impl Channel {
    pub const ALL: &'static [&'static str] = &["stable", "insiders"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Insiders => "insiders",
        }
    }

    /// Executable name searched in PATH when the channel is not configured
    pub fn executable_name(&self) -> &'static str {
        match self {
            Channel::Stable => "code",
            Channel::Insiders => "code-insiders",
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stable" => Ok(Channel::Stable),
            "insiders" => Ok(Channel::Insiders),
            other => Err(format!(
                "unknown channel '{}' (expected one of: {})",
                other,
                Channel::ALL.join(", ")
            )),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel plus optional semver requirement, written `insiders@>=1.95`
#[derive(Debug, Clone, PartialEq)]
pub struct VersionSpec {
    pub channel: Channel,
    pub requirement: Option<semver::VersionReq>,
}

impl VersionSpec {
    pub fn channel(channel: Channel) -> Self {
        Self {
            channel,
            requirement: None,
        }
    }

    /// Whether a concrete editor version satisfies the requirement
    pub fn accepts(&self, version: &semver::Version) -> bool {
        self.requirement
            .as_ref()
            .map(|req| req.matches(version))
            .unwrap_or(true)
    }
}

impl Default for VersionSpec {
    fn default() -> Self {
        Self::channel(Channel::Stable)
    }
}

impl FromStr for VersionSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, requirement) = match s.split_once('@') {
            Some((channel, req)) => (channel, Some(req)),
            None => (s, None),
        };
        let channel = channel.parse::<Channel>()?;
        let requirement = requirement
            .map(|req| {
                semver::VersionReq::parse(req.trim())
                    .map_err(|e| format!("invalid version requirement '{}': {}", req, e))
            })
            .transpose()?;
        Ok(Self {
            channel,
            requirement,
        })
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.requirement {
            Some(req) => write!(f, "{}@{}", self.channel, req),
            None => write!(f, "{}", self.channel),
        }
    }
}

impl Serialize for VersionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Target environment requirements
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EnvironmentRequirements {
    pub version: VersionSpec,
    /// Named profile used for sandbox reset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Folder opened in the editor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

/// Scenario-level timeout defaults in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Timeouts {
    #[serde(rename = "step", skip_serializing_if = "Option::is_none")]
    pub step_ms: Option<u64>,
    #[serde(rename = "scenario", skip_serializing_if = "Option::is_none")]
    pub scenario_ms: Option<u64>,
}

impl Timeouts {
    pub fn is_unset(&self) -> bool {
        self.step_ms.is_none() && self.scenario_ms.is_none()
    }
}

/// Step kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Action,
    Wait,
    Assertion,
}

impl StepKind {
    pub const ALL: &'static [&'static str] = &["action", "wait", "assertion"];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Action => "action",
            StepKind::Wait => "wait",
            StepKind::Assertion => "assertion",
        }
    }
}

impl FromStr for StepKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action" => Ok(Self::Action),
            "wait" => Ok(Self::Wait),
            "assertion" => Ok(Self::Assertion),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step acts on: a selector, or a description the driver resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Selector(String),
    Semantic(String),
}

impl Target {
    /// Field name used in scenario files and on the driver wire
    pub fn field(&self) -> &'static str {
        match self {
            Target::Selector(_) => "selector",
            Target::Semantic(_) => "description",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Target::Selector(s) | Target::Semantic(s) => s,
        }
    }
}

// Written as a one-entry mapping (`{ selector: ... }`) rather than a
// tagged enum, which YAML would render as a `!selector` tag.
impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.field(), self.value())?;
        map.end()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Selector(s) => write!(f, "{}", s),
            Target::Semantic(d) => write!(f, "\"{}\"", d),
        }
    }
}

/// Kind-dependent step parameters
pub type Params = BTreeMap<String, serde_json::Value>;

/// A single scenario step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    /// Optional label used in reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: StepKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: Params,
    /// Per-step timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// A failed blocking step aborts the remaining sequence
    #[serde(skip_serializing_if = "is_true")]
    pub blocking: bool,
}

fn is_true(value: &bool) -> bool {
    *value
}

impl Step {
    /// One-line description for transcripts and reports
    pub fn summary(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let verb = self
            .params
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or(self.kind.as_str());
        match &self.target {
            Some(target) => format!("{} {}", verb, target),
            None => verb.to_string(),
        }
    }
}

/// Element expectations shared by assertion steps and final-state checks
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssertionSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_equals: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl AssertionSpec {
    pub const FIELDS: &'static [&'static str] =
        &["visible", "text_equals", "text_contains", "count"];

    pub fn is_empty(&self) -> bool {
        self.visible.is_none()
            && self.text_equals.is_none()
            && self.text_contains.is_none()
            && self.count.is_none()
    }
}

/// A structured check of the final editor state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeAssertion {
    pub target: Target,
    #[serde(flatten)]
    pub expect: AssertionSpec,
}

/// Expected outcome: natural language plus optional structured checks
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ExpectedOutcome {
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<OutcomeAssertion>,
}
