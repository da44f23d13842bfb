//! CLI command definitions
//!
//! Defines the clap commands for the uxtest CLI.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::capture::ScreenshotMethod;
use crate::scenario::VersionSpec;

#[derive(Subcommand)]
pub enum Commands {
    /// Run scenarios against VS Code
    Run(RunArgs),

    /// List available scenarios
    List {
        /// Only list scenarios with this tag
        #[arg(long)]
        tag: Option<String>,

        /// Directory containing scenario files
        #[arg(long, default_value = "scenarios")]
        scenarios: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Scenario id to run
    #[arg(required_unless_present_any = ["all", "tag", "validate"])]
    pub scenario: Option<String>,

    /// Run every scenario
    #[arg(long, conflicts_with = "scenario")]
    pub all: bool,

    /// Run every scenario with this tag
    #[arg(long, conflicts_with = "scenario")]
    pub tag: Option<String>,

    /// Editor channel and optional version requirement, e.g. insiders@>=1.95
    #[arg(long = "vscode-version")]
    pub vscode_version: Option<VersionSpec>,

    /// Named profile to reset from or reuse
    #[arg(long)]
    pub profile: Option<String>,

    /// Reuse the profile's current state instead of resetting it
    #[arg(long, conflicts_with = "fresh_profile")]
    pub no_sandbox_reset: bool,

    /// Start from an empty throwaway profile with extensions disabled
    #[arg(long)]
    pub fresh_profile: bool,

    /// Skip the LLM judge and decide from step results alone
    #[arg(long)]
    pub no_llm: bool,

    /// Do not capture screenshots, video or logs
    #[arg(long)]
    pub no_artifacts: bool,

    /// Record a screen video of each run
    #[arg(long, conflicts_with = "no_artifacts")]
    pub video: bool,

    /// How screenshots are taken
    #[arg(long, value_enum)]
    pub screenshot_method: Option<ScreenshotMethod>,

    /// Rerun whenever a scenario file changes
    #[arg(long)]
    pub watch: bool,

    /// Directory for run records and artifacts
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Run each scenario on several versions and diff the results, e.g. stable,insiders
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub compare: Vec<VersionSpec>,

    /// Only validate scenario files
    #[arg(long)]
    pub validate: bool,

    /// Checkpoint after every step regardless of scenario size
    #[arg(long)]
    pub orchestrated: bool,

    /// Treat validation warnings as errors
    #[arg(long)]
    pub strict: bool,

    /// Directory containing scenario files
    #[arg(long, default_value = "scenarios")]
    pub scenarios: PathBuf,

    /// Verbose output
    #[arg(long, short)]
    pub verbose: bool,
}
