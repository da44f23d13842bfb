//! Artifact capture
//!
//! Video, screenshots and logs are recorded by interchangeable backends
//! running next to step execution. A backend failure is never fatal to a
//! run: it surfaces as a warning in the `CaptureReport`.

mod logtail;
mod screenshot;
mod session;
mod video;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::common::config::CaptureConfig;
use crate::driver::Driver;
use crate::provision::EnvironmentHandle;

pub use logtail::LogTailCapture;
pub use screenshot::ScreenshotCapture;
pub use session::{CaptureReport, CaptureSession};
pub use video::VideoCapture;

/// Capture backend failures, downgraded to warnings by the session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactCaptureError {
    #[error("{backend} capture could not start: {error}")]
    Start { backend: String, error: String },

    #[error("{backend} capture failed: {error}")]
    Backend { backend: String, error: String },

    #[error("'{tool}' not found; install it or disable {backend} capture")]
    ToolMissing { backend: String, tool: String },
}

impl ArtifactCaptureError {
    pub(crate) fn backend(backend: &str, error: impl std::fmt::Display) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            error: error.to_string(),
        }
    }
}

/// How screenshots are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotMethod {
    /// Electron's own page capture, through the driver
    #[default]
    Electron,
    /// Operating system screenshot tool
    Os,
    /// Playwright page screenshot, through the driver
    Playwright,
}

impl ScreenshotMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenshotMethod::Electron => "electron",
            ScreenshotMethod::Os => "os",
            ScreenshotMethod::Playwright => "playwright",
        }
    }
}

/// Kind of recorded evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Video,
    Screenshot,
    Log,
}

/// One recorded piece of evidence, owned by exactly one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// Capture method that produced the file
    pub method: String,
    pub captured_at: DateTime<Utc>,
    pub run_id: String,
    /// Step the artifact is keyed to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    /// Retained artifacts survive discarding their run
    #[serde(default)]
    pub retained: bool,
}

/// Things that happen on the step timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    StepStarted { index: usize },
    StepFinished { index: usize, status: String },
    /// Evidence requested now, e.g. right after a step timed out
    Snapshot { reason: String, step_index: Option<usize> },
}

/// Everything a backend may need while recording one run
#[derive(Clone)]
pub struct CaptureContext {
    pub run_id: String,
    /// Where artifact files are written
    pub artifacts_dir: PathBuf,
    /// Editor log directory
    pub logs_dir: PathBuf,
    /// Driver for driver-side screenshots
    pub driver: Option<Arc<dyn Driver>>,
}

impl CaptureContext {
    pub fn new(run_id: &str, artifacts_dir: &Path, env: &EnvironmentHandle) -> Self {
        Self {
            run_id: run_id.to_string(),
            artifacts_dir: artifacts_dir.to_path_buf(),
            logs_dir: env.logs_dir.clone(),
            driver: None,
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub(crate) fn artifact(
        &self,
        kind: ArtifactKind,
        path: PathBuf,
        method: &str,
        step_index: Option<usize>,
    ) -> Artifact {
        Artifact {
            kind,
            path,
            method: method.to_string(),
            captured_at: Utc::now(),
            run_id: self.run_id.clone(),
            step_index,
            retained: false,
        }
    }
}

/// A way of recording evidence
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begin recording for one run
    async fn start(&self, ctx: &CaptureContext) -> Result<Box<dyn ActiveCapture>, ArtifactCaptureError>;
}

/// A backend recording one run
#[async_trait]
pub trait ActiveCapture: Send {
    /// React to the step timeline
    async fn on_event(&mut self, event: &CaptureEvent) -> Result<(), ArtifactCaptureError>;

    /// Periodic work, if the backend wants any
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn tick(&mut self) -> Result<(), ArtifactCaptureError> {
        Ok(())
    }

    /// Flush and close; returns every artifact the backend produced
    async fn finish(self: Box<Self>) -> Result<Vec<Artifact>, ArtifactCaptureError>;
}

/// Backends enabled by the capture settings of a run
pub fn backends_for(config: &CaptureConfig, video: bool) -> Vec<Arc<dyn CaptureBackend>> {
    let mut backends: Vec<Arc<dyn CaptureBackend>> = vec![
        Arc::new(
            ScreenshotCapture::new(
                config.screenshot_method,
                Duration::from_millis(config.screenshot_interval_ms),
            )
            .with_timeout(Duration::from_millis(config.screenshot_timeout_ms)),
        ),
        Arc::new(LogTailCapture::new(Duration::from_millis(config.log_poll_ms))),
    ];
    if video {
        backends.push(Arc::new(VideoCapture::new(
            config.ffmpeg.clone(),
            config.video_fps,
        )));
    }
    backends
}

/// File-name safe version of a label
pub(crate) fn slug(label: &str) -> String {
    let slug: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.chars().take(40).collect()
}
