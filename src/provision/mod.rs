//! Environment provisioning
//!
//! An `EnvironmentHandle` is the scoped resource a run owns for its whole
//! lifetime: the editor process, its profile directory and the debugging
//! port the automation driver attaches to. Handles are never shared
//! between runs and are always handed back through `Provisioner::release`.

mod editor;
mod profile;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::scenario::{Channel, ScenarioDefinition, VersionSpec};

pub use editor::EditorProvisioner;
pub use profile::{prepare_profile, PreparedProfile};

/// Errors raised while acquiring an environment
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Channel '{channel}' is not installed (searched for '{searched}'). Set [channels.{channel}].executable in config.toml or install it")]
    ChannelUnavailable { channel: String, searched: String },

    #[error("Could not determine the version of '{executable}': {error}")]
    VersionProbe { executable: String, error: String },

    #[error("Installed {channel} version {found} does not satisfy '{required}'")]
    VersionMismatch {
        channel: String,
        found: String,
        required: String,
    },

    #[error("Workspace '{0}' does not exist")]
    WorkspaceMissing(String),

    #[error("Failed to prepare profile '{profile}': {error}")]
    Profile { profile: String, error: String },

    #[error("Failed to launch '{executable}': {error}")]
    Launch { executable: String, error: String },

    #[error("Editor ({channel}) did not become responsive within {secs}s")]
    StartupTimeout { channel: String, secs: u64 },
}

/// How the profile is isolated from previous runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Reuse a named profile, restored to its baseline first
    SandboxReset,
    /// Reuse a named profile as it is
    Reuse,
    /// Throwaway profile with no extensions or auth
    FreshProfile,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::SandboxReset => "sandbox_reset",
            IsolationMode::Reuse => "reuse",
            IsolationMode::FreshProfile => "fresh_profile",
        }
    }
}

/// What a run asks the provisioner for
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub version: VersionSpec,
    /// Named profile; the configured default is used when unset
    pub profile: Option<String>,
    pub workspace: Option<PathBuf>,
    pub isolation: IsolationMode,
}

impl ProvisionRequest {
    /// Build a request from a scenario's environment requirements
    pub fn for_scenario(scenario: &ScenarioDefinition, isolation: IsolationMode) -> Self {
        Self {
            version: scenario.environment.version.clone(),
            profile: scenario.environment.profile.clone(),
            workspace: scenario.environment.workspace.clone(),
            isolation,
        }
    }
}

/// Environment details recorded on a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEnvironment {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub profile: String,
    pub isolation: IsolationMode,
}

/// A provisioned, isolated editor instance
pub struct EnvironmentHandle {
    /// Unique id of this acquisition
    pub id: String,
    pub channel: Channel,
    /// Version reported by the executable
    pub version: Option<semver::Version>,
    pub isolation: IsolationMode,
    /// Profile name (or `fresh` for throwaway profiles)
    pub profile: String,
    /// `--user-data-dir` of the editor
    pub profile_dir: PathBuf,
    /// Directory the editor writes its logs to
    pub logs_dir: PathBuf,
    pub workspace: Option<PathBuf>,
    /// Remote debugging port the driver attaches to
    pub debug_port: Option<u16>,
    /// Process and temp dirs owned by a real editor launch
    resources: Option<editor::EditorResources>,
}

impl EnvironmentHandle {
    /// Handle without an attached process, for provisioners that manage
    /// resources themselves
    pub fn new(id: impl Into<String>, channel: Channel, profile_dir: PathBuf) -> Self {
        let logs_dir = profile_dir.join("logs");
        Self {
            id: id.into(),
            channel,
            version: None,
            isolation: IsolationMode::FreshProfile,
            profile: "fresh".to_string(),
            profile_dir,
            logs_dir,
            workspace: None,
            debug_port: None,
            resources: None,
        }
    }

    /// What gets recorded on the run
    pub fn resolved(&self) -> ResolvedEnvironment {
        ResolvedEnvironment {
            channel: self.channel,
            version: self.version.as_ref().map(|v| v.to_string()),
            profile: self.profile.clone(),
            isolation: self.isolation,
        }
    }
}

impl std::fmt::Debug for EnvironmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("profile_dir", &self.profile_dir)
            .field("debug_port", &self.debug_port)
            .finish_non_exhaustive()
    }
}

/// Acquires and releases isolated editor environments
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Launch an environment matching the request, failing fast when the
    /// requested channel or version is unavailable
    async fn acquire(&self, request: &ProvisionRequest) -> Result<EnvironmentHandle, ProvisionError>;

    /// Tear the environment down; never fails
    async fn release(&self, handle: EnvironmentHandle);
}
