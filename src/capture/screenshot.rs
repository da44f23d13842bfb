//! Screenshots at step boundaries, on demand and on an interval

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use super::{
    slug, ActiveCapture, Artifact, ArtifactCaptureError, ArtifactKind, CaptureBackend,
    CaptureContext, CaptureEvent, ScreenshotMethod,
};
use crate::driver::Driver;

const BACKEND: &str = "screenshot";

const DEFAULT_SHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Screenshot backend for one method
pub struct ScreenshotCapture {
    method: ScreenshotMethod,
    interval: Duration,
    timeout: Duration,
}

impl ScreenshotCapture {
    pub fn new(method: ScreenshotMethod, interval: Duration) -> Self {
        Self {
            method,
            interval,
            timeout: DEFAULT_SHOT_TIMEOUT,
        }
    }

    /// Longest a single screenshot may take before it is given up
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Where screenshots come from
enum Source {
    Driver(Arc<dyn Driver>),
    /// OS tool and the arguments preceding the output path
    Tool(PathBuf, Vec<&'static str>),
}

struct ActiveScreenshots {
    ctx: CaptureContext,
    method: ScreenshotMethod,
    source: Source,
    interval: Duration,
    timeout: Duration,
    taken: Vec<Artifact>,
    ticks: usize,
}

#[async_trait]
impl CaptureBackend for ScreenshotCapture {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn start(&self, ctx: &CaptureContext) -> Result<Box<dyn ActiveCapture>, ArtifactCaptureError> {
        let source = match self.method {
            ScreenshotMethod::Electron | ScreenshotMethod::Playwright => {
                let driver = ctx.driver.clone().ok_or_else(|| ArtifactCaptureError::Start {
                    backend: BACKEND.to_string(),
                    error: format!("{} screenshots need a connected driver", self.method.as_str()),
                })?;
                Source::Driver(driver)
            }
            ScreenshotMethod::Os => {
                let (tool, args) = os_tool()?;
                Source::Tool(tool, args)
            }
        };

        Ok(Box::new(ActiveScreenshots {
            ctx: ctx.clone(),
            method: self.method,
            source,
            interval: self.interval,
            timeout: self.timeout,
            taken: Vec::new(),
            ticks: 0,
        }))
    }
}

impl ActiveScreenshots {
    async fn take(&mut self, name: String, step_index: Option<usize>) -> Result<(), ArtifactCaptureError> {
        let path = self.ctx.artifacts_dir.join(format!("{}.png", name));
        let shot = async {
            match &self.source {
                Source::Driver(driver) => {
                    let png = driver
                        .screenshot(self.method.as_str())
                        .await
                        .map_err(|e| ArtifactCaptureError::backend(BACKEND, e))?;
                    tokio::fs::write(&path, png)
                        .await
                        .map_err(|e| ArtifactCaptureError::backend(BACKEND, e))?;
                }
                Source::Tool(tool, args) => run_tool(tool, args, &path).await?,
            }
            Ok::<(), ArtifactCaptureError>(())
        };
        tokio::time::timeout(self.timeout, shot).await.map_err(|_| {
            ArtifactCaptureError::backend(
                BACKEND,
                format!("{} not taken within {}ms", name, self.timeout.as_millis()),
            )
        })??;
        tracing::trace!(path = %path.display(), "Screenshot captured");
        let artifact = self
            .ctx
            .artifact(ArtifactKind::Screenshot, path, self.method.as_str(), step_index);
        self.taken.push(artifact);
        Ok(())
    }
}

#[async_trait]
impl ActiveCapture for ActiveScreenshots {
    async fn on_event(&mut self, event: &CaptureEvent) -> Result<(), ArtifactCaptureError> {
        match event {
            CaptureEvent::StepStarted { .. } => Ok(()),
            CaptureEvent::StepFinished { index, status } => {
                self.take(format!("step-{:03}-{}", index, slug(status)), Some(*index))
                    .await
            }
            CaptureEvent::Snapshot { reason, step_index } => {
                let name = match step_index {
                    Some(i) => format!("snapshot-{:03}-{}", i, slug(reason)),
                    None => format!("snapshot-{}", slug(reason)),
                };
                self.take(name, *step_index).await
            }
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn tick(&mut self) -> Result<(), ArtifactCaptureError> {
        self.ticks += 1;
        let name = format!("interval-{:04}", self.ticks);
        self.take(name, None).await
    }

    async fn finish(self: Box<Self>) -> Result<Vec<Artifact>, ArtifactCaptureError> {
        Ok(self.taken)
    }
}

/// Find a screenshot tool for this platform
fn os_tool() -> Result<(PathBuf, Vec<&'static str>), ArtifactCaptureError> {
    let candidates: &[(&str, &[&'static str])] = if cfg!(target_os = "macos") {
        &[("screencapture", &["-x"][..])]
    } else {
        &[
            ("import", &["-window", "root"][..]),
            ("gnome-screenshot", &["-f"][..]),
            ("grim", &[][..]),
        ]
    };

    candidates
        .iter()
        .find_map(|(tool, args)| which::which(tool).ok().map(|p| (p, args.to_vec())))
        .ok_or_else(|| ArtifactCaptureError::ToolMissing {
            backend: BACKEND.to_string(),
            tool: candidates
                .iter()
                .map(|(t, _)| *t)
                .collect::<Vec<_>>()
                .join(" / "),
        })
}

async fn run_tool(tool: &Path, args: &[&'static str], path: &Path) -> Result<(), ArtifactCaptureError> {
    let status = Command::new(tool)
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| ArtifactCaptureError::backend(BACKEND, e))?;
    if !status.success() {
        return Err(ArtifactCaptureError::backend(
            BACKEND,
            format!("{} exited with {}", tool.display(), status),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, ElementSnapshot};
    use crate::scenario::{ActionInstruction, Target, WaitState};

    struct PngDriver;

    #[async_trait]
    impl Driver for PngDriver {
        async fn perform(&self, _: &ActionInstruction, _: Option<&Target>) -> Result<(), DriverError> {
            Ok(())
        }
        async fn wait_for(&self, _: &Target, _: WaitState, _: Duration) -> Result<(), DriverError> {
            Ok(())
        }
        async fn inspect(&self, _: &Target) -> Result<ElementSnapshot, DriverError> {
            Ok(ElementSnapshot::default())
        }
        async fn screenshot(&self, method: &str) -> Result<Vec<u8>, DriverError> {
            assert_eq!(method, "electron");
            Ok(b"\x89PNG".to_vec())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_driver_screenshots_keyed_to_steps() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CaptureContext {
            run_id: "run-1".into(),
            artifacts_dir: dir.path().to_path_buf(),
            logs_dir: dir.path().join("logs"),
            driver: Some(Arc::new(PngDriver)),
        };
        let backend = ScreenshotCapture::new(ScreenshotMethod::Electron, Duration::ZERO);
        let mut active = backend.start(&ctx).await.unwrap();
        active
            .on_event(&CaptureEvent::StepFinished {
                index: 2,
                status: "timed_out".into(),
            })
            .await
            .unwrap();
        let artifacts = active.finish().await.unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].step_index, Some(2));
        assert!(artifacts[0].path.ends_with("step-002-timed-out.png"));
        assert!(artifacts[0].path.exists());
    }

    #[tokio::test]
    async fn test_driver_method_without_driver_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CaptureContext {
            run_id: "run-1".into(),
            artifacts_dir: dir.path().to_path_buf(),
            logs_dir: dir.path().join("logs"),
            driver: None,
        };
        let backend = ScreenshotCapture::new(ScreenshotMethod::Playwright, Duration::ZERO);
        assert!(matches!(
            backend.start(&ctx).await,
            Err(ArtifactCaptureError::Start { .. })
        ));
    }

    struct FrozenDriver;

    #[async_trait]
    impl Driver for FrozenDriver {
        async fn perform(&self, _: &ActionInstruction, _: Option<&Target>) -> Result<(), DriverError> {
            Ok(())
        }
        async fn wait_for(&self, _: &Target, _: WaitState, _: Duration) -> Result<(), DriverError> {
            Ok(())
        }
        async fn inspect(&self, _: &Target) -> Result<ElementSnapshot, DriverError> {
            Ok(ElementSnapshot::default())
        }
        async fn screenshot(&self, _: &str) -> Result<Vec<u8>, DriverError> {
            std::future::pending().await
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_unanswered_screenshot_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CaptureContext {
            run_id: "run-1".into(),
            artifacts_dir: dir.path().to_path_buf(),
            logs_dir: dir.path().join("logs"),
            driver: Some(Arc::new(FrozenDriver)),
        };
        let backend = ScreenshotCapture::new(ScreenshotMethod::Electron, Duration::ZERO)
            .with_timeout(Duration::from_millis(50));
        let mut active = backend.start(&ctx).await.unwrap();
        let err = active
            .on_event(&CaptureEvent::StepFinished {
                index: 0,
                status: "succeeded".into(),
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("step-000-succeeded not taken within 50ms"));
        assert!(active.finish().await.unwrap().is_empty());
    }
}
