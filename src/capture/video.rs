//! Full-window video through ffmpeg screen grabbing

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use super::{
    ActiveCapture, Artifact, ArtifactCaptureError, ArtifactKind, CaptureBackend, CaptureContext,
    CaptureEvent,
};

const BACKEND: &str = "video";

/// How long ffmpeg gets to finalize the container after `q`
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct VideoCapture {
    ffmpeg: Option<PathBuf>,
    fps: u32,
}

impl VideoCapture {
    pub fn new(ffmpeg: Option<PathBuf>, fps: u32) -> Self {
        Self { ffmpeg, fps }
    }

    fn resolve_ffmpeg(&self) -> Result<PathBuf, ArtifactCaptureError> {
        match &self.ffmpeg {
            Some(path) => Ok(path.clone()),
            None => which::which("ffmpeg").map_err(|_| ArtifactCaptureError::ToolMissing {
                backend: BACKEND.to_string(),
                tool: "ffmpeg".to_string(),
            }),
        }
    }
}

/// Platform screen grabber input arguments
fn grab_input() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["-f".into(), "avfoundation".into(), "-i".into(), "1:none".into()]
    } else if cfg!(windows) {
        vec!["-f".into(), "gdigrab".into(), "-i".into(), "desktop".into()]
    } else {
        let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
        vec!["-f".into(), "x11grab".into(), "-i".into(), display]
    }
}

struct ActiveVideo {
    ctx: CaptureContext,
    child: Child,
    path: PathBuf,
}

#[async_trait]
impl CaptureBackend for VideoCapture {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn start(&self, ctx: &CaptureContext) -> Result<Box<dyn ActiveCapture>, ArtifactCaptureError> {
        let ffmpeg = self.resolve_ffmpeg()?;
        let path = ctx.artifacts_dir.join("session.mp4");

        let child = Command::new(&ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .arg("-framerate")
            .arg(self.fps.to_string())
            .args(grab_input())
            .args(["-pix_fmt", "yuv420p"])
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ArtifactCaptureError::Start {
                backend: BACKEND.to_string(),
                error: format!("{}: {}", ffmpeg.display(), e),
            })?;

        tracing::debug!(path = %path.display(), "Video capture started");
        Ok(Box::new(ActiveVideo {
            ctx: ctx.clone(),
            child,
            path,
        }))
    }
}

#[async_trait]
impl ActiveCapture for ActiveVideo {
    async fn on_event(&mut self, _event: &CaptureEvent) -> Result<(), ArtifactCaptureError> {
        // One continuous recording; step boundaries are in the run record
        if let Ok(Some(status)) = self.child.try_wait() {
            return Err(ArtifactCaptureError::backend(
                BACKEND,
                format!("ffmpeg exited early ({})", status),
            ));
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Vec<Artifact>, ArtifactCaptureError> {
        let mut this = self;
        // `q` asks ffmpeg to stop and write the trailer
        if let Some(mut stdin) = this.child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(FINALIZE_TIMEOUT, this.child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                tracing::debug!("ffmpeg exited with {}", status);
            }
            Ok(_) => {}
            Err(_) => {
                let _ = this.child.kill().await;
                return Err(ArtifactCaptureError::backend(
                    BACKEND,
                    "ffmpeg did not finalize the recording in time",
                ));
            }
        }

        if !this.path.exists() {
            return Err(ArtifactCaptureError::backend(BACKEND, "no recording was written"));
        }
        let artifact = this
            .ctx
            .artifact(ArtifactKind::Video, this.path.clone(), "ffmpeg", None);
        Ok(vec![artifact])
    }
}
