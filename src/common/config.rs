//! Configuration file handling

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};
use crate::capture::ScreenshotMethod;
use crate::scenario::Channel;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Editor executables per release channel
    #[serde(default)]
    pub channels: Channels,

    /// Automation driver helper process
    #[serde(default)]
    pub driver: DriverConfig,

    /// Environment provisioning settings
    #[serde(default)]
    pub provision: ProvisionConfig,

    /// Step and scenario execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Artifact capture settings
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Evaluation judge settings
    #[serde(default)]
    pub judge: JudgeConfig,

    /// Cross-version comparison settings
    #[serde(default)]
    pub compare: CompareConfig,

    /// Watch mode settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Persisted output settings
    #[serde(default)]
    pub output: OutputConfig,
}

/// Executables for each release channel
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Channels {
    pub stable: Option<ChannelConfig>,
    pub insiders: Option<ChannelConfig>,
}

impl Channels {
    /// Explicit configuration for a channel, if any
    pub fn get(&self, channel: Channel) -> Option<&ChannelConfig> {
        match channel {
            Channel::Stable => self.stable.as_ref(),
            Channel::Insiders => self.insiders.as_ref(),
        }
    }
}

/// Configuration for one editor channel
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Path to the editor executable
    pub executable: PathBuf,

    /// Additional arguments passed on every launch
    #[serde(default)]
    pub args: Vec<String>,
}

/// Automation driver helper configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DriverConfig {
    /// Command that starts the driver helper
    #[serde(default = "default_driver_command")]
    pub command: PathBuf,

    /// Arguments for the driver helper
    #[serde(default = "default_driver_args")]
    pub args: Vec<String>,

    /// Timeout for the driver handshake
    #[serde(default = "default_driver_connect")]
    pub connect_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: default_driver_command(),
            args: default_driver_args(),
            connect_timeout_secs: default_driver_connect(),
        }
    }
}

fn default_driver_command() -> PathBuf {
    PathBuf::from("npx")
}
fn default_driver_args() -> Vec<String> {
    vec!["vscode-uxtest-driver".to_string()]
}
fn default_driver_connect() -> u64 {
    30
}

/// Provisioning configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProvisionConfig {
    /// How long to wait for the editor to become responsive
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period between SIGTERM and kill on release
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Root of named profiles (defaults to the data dir)
    pub profiles_dir: Option<PathBuf>,

    /// Profile used for sandbox reset when a scenario names none
    #[serde(default = "default_profile")]
    pub default_profile: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            profiles_dir: None,
            default_profile: default_profile(),
        }
    }
}

fn default_startup_timeout() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    2_000
}
fn default_profile() -> String {
    "uxtest".to_string()
}

/// Execution configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Step timeout when neither the step nor the scenario sets one
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,

    /// Total scenario budget in direct mode
    #[serde(default = "default_scenario_timeout")]
    pub scenario_timeout_secs: u64,

    /// Extra attempts for transient automation errors
    #[serde(default = "default_step_retries")]
    pub step_retries: u32,

    /// Base backoff between attempts (multiplied by the attempt number)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Scenarios with more steps than this run in orchestrated mode
    #[serde(default = "default_orchestrated_steps")]
    pub orchestrated_step_threshold: usize,

    /// Scenarios whose summed step timeouts exceed this run orchestrated
    #[serde(default = "default_orchestrated_duration")]
    pub orchestrated_duration_secs: u64,

    /// How long a failure snapshot may take before teardown proceeds
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_ms: u64,

    /// How long capture backends may take to flush when a run ends
    #[serde(default = "default_capture_stop_timeout")]
    pub capture_stop_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout(),
            scenario_timeout_secs: default_scenario_timeout(),
            step_retries: default_step_retries(),
            retry_backoff_ms: default_retry_backoff(),
            orchestrated_step_threshold: default_orchestrated_steps(),
            orchestrated_duration_secs: default_orchestrated_duration(),
            snapshot_timeout_ms: default_snapshot_timeout(),
            capture_stop_timeout_ms: default_capture_stop_timeout(),
        }
    }
}

fn default_step_timeout() -> u64 {
    10_000
}
fn default_scenario_timeout() -> u64 {
    300
}
fn default_step_retries() -> u32 {
    2
}
fn default_retry_backoff() -> u64 {
    250
}
fn default_orchestrated_steps() -> usize {
    25
}
fn default_orchestrated_duration() -> u64 {
    600
}
fn default_snapshot_timeout() -> u64 {
    5_000
}
fn default_capture_stop_timeout() -> u64 {
    20_000
}

/// Artifact capture configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Screenshot backend
    #[serde(default)]
    pub screenshot_method: ScreenshotMethod,

    /// Periodic screenshots in addition to step boundaries (0 disables)
    #[serde(default)]
    pub screenshot_interval_ms: u64,

    /// A screenshot not taken within this is abandoned
    #[serde(default = "default_screenshot_timeout")]
    pub screenshot_timeout_ms: u64,

    /// How often the editor log directory is polled
    #[serde(default = "default_log_poll")]
    pub log_poll_ms: u64,

    /// ffmpeg executable for video capture (searched in PATH if unset)
    pub ffmpeg: Option<PathBuf>,

    /// Video frame rate
    #[serde(default = "default_video_fps")]
    pub video_fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            screenshot_method: ScreenshotMethod::default(),
            screenshot_interval_ms: 0,
            screenshot_timeout_ms: default_screenshot_timeout(),
            log_poll_ms: default_log_poll(),
            ffmpeg: None,
            video_fps: default_video_fps(),
        }
    }
}

fn default_screenshot_timeout() -> u64 {
    10_000
}
fn default_log_poll() -> u64 {
    500
}
fn default_video_fps() -> u32 {
    15
}

/// Evaluation judge configuration
#[derive(Debug, Deserialize, Clone)]
pub struct JudgeConfig {
    /// Chat completions endpoint of the grader
    #[serde(default = "default_judge_endpoint")]
    pub endpoint: String,

    /// Model name sent with each request
    #[serde(default = "default_judge_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_judge_key_env")]
    pub api_key_env: String,

    /// Upper bound on grader invocations per verdict
    #[serde(default = "default_max_invocations")]
    pub max_invocations: u32,

    /// Number of agreeing decisions required to accept a verdict
    #[serde(default = "default_quorum")]
    pub quorum: u32,

    /// Per-request timeout
    #[serde(default = "default_judge_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_judge_endpoint(),
            model: default_judge_model(),
            api_key_env: default_judge_key_env(),
            max_invocations: default_max_invocations(),
            quorum: default_quorum(),
            request_timeout_secs: default_judge_timeout(),
        }
    }
}

fn default_judge_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_judge_model() -> String {
    "gpt-4o".to_string()
}
fn default_judge_key_env() -> String {
    "UXTEST_JUDGE_API_KEY".to_string()
}
fn default_max_invocations() -> u32 {
    3
}
fn default_quorum() -> u32 {
    2
}
fn default_judge_timeout() -> u64 {
    60
}

/// Comparison configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CompareConfig {
    /// Maximum number of simultaneously provisioned environments, for both
    /// comparisons and multi-scenario batches
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_max_parallel() -> usize {
    2
}

/// Watch mode configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Quiet period after the last change before a rerun starts
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
        }
    }
}

fn default_debounce() -> u64 {
    500
}

/// Output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Directory run records and artifacts are written to
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("uxtest-results")
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content =
                    std::fs::read_to_string(&path).map_err(|e| Error::file_read(&path, e))?;
                let config = Self::from_toml(&content)?;
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.judge.quorum == 0 {
            return Err(Error::Config("judge.quorum must be at least 1".to_string()));
        }
        if self.judge.quorum > self.judge.max_invocations {
            return Err(Error::Config(format!(
                "judge.quorum ({}) cannot exceed judge.max_invocations ({})",
                self.judge.quorum, self.judge.max_invocations
            )));
        }
        if self.compare.max_parallel == 0 {
            return Err(Error::Config(
                "compare.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.execution.step_timeout_ms == 0 || self.execution.scenario_timeout_secs == 0 {
            return Err(Error::Config("execution timeouts must be positive".to_string()));
        }
        if self.provision.startup_timeout_secs == 0 {
            return Err(Error::Config(
                "provision.startup_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Root directory for named profiles
    pub fn profiles_dir(&self) -> PathBuf {
        self.provision
            .profiles_dir
            .clone()
            .unwrap_or_else(super::paths::profiles_dir)
    }

    /// Default per-step timeout
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.step_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.judge.max_invocations, 3);
        assert_eq!(config.judge.quorum, 2);
        assert_eq!(config.compare.max_parallel, 2);
        assert_eq!(config.execution.step_retries, 2);
        assert!(config.channels.get(Channel::Stable).is_none());
    }

    #[test]
    fn test_channel_and_capture_sections() {
        let config = Config::from_toml(
            r#"
[channels.insiders]
executable = "/opt/code-insiders/bin/code-insiders"
args = ["--verbose"]

[capture]
screenshot_method = "os"
screenshot_interval_ms = 1000
"#,
        )
        .unwrap();

        let insiders = config.channels.get(Channel::Insiders).unwrap();
        assert_eq!(insiders.args, vec!["--verbose".to_string()]);
        assert_eq!(config.capture.screenshot_method, ScreenshotMethod::Os);
        assert_eq!(config.capture.screenshot_interval_ms, 1000);
    }

    #[test]
    fn test_quorum_larger_than_budget_is_rejected() {
        let err = Config::from_toml("[judge]\nmax_invocations = 1\nquorum = 2\n").unwrap_err();
        assert!(err.to_string().contains("quorum"));
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        assert!(Config::from_toml("[compare]\nmax_parallel = 0\n").is_err());
    }
}
