//! Editor log tailing
//!
//! The editor spreads its logs over many files below `logs/`. New bytes from
//! every file are appended to a single `editor.log` artifact, with a header
//! whenever the source file changes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use walkdir::WalkDir;

use super::{
    ActiveCapture, Artifact, ArtifactCaptureError, ArtifactKind, CaptureBackend, CaptureContext,
    CaptureEvent,
};

const BACKEND: &str = "log";

pub struct LogTailCapture {
    poll: Duration,
}

impl LogTailCapture {
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }
}

struct ActiveLogTail {
    ctx: CaptureContext,
    poll: Duration,
    output: File,
    output_path: PathBuf,
    /// Bytes already copied per source file
    offsets: HashMap<PathBuf, u64>,
    last_source: Option<PathBuf>,
    written: u64,
}

#[async_trait]
impl CaptureBackend for LogTailCapture {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn start(&self, ctx: &CaptureContext) -> Result<Box<dyn ActiveCapture>, ArtifactCaptureError> {
        let output_path = ctx.artifacts_dir.join("editor.log");
        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)
            .await
            .map_err(|e| ArtifactCaptureError::Start {
                backend: BACKEND.to_string(),
                error: format!("{}: {}", output_path.display(), e),
            })?;

        Ok(Box::new(ActiveLogTail {
            ctx: ctx.clone(),
            poll: self.poll,
            output,
            output_path,
            offsets: HashMap::new(),
            last_source: None,
            written: 0,
        }))
    }
}

impl ActiveLogTail {
    /// Copy whatever was appended to the editor logs since the last poll
    async fn poll_logs(&mut self) -> Result<(), ArtifactCaptureError> {
        if !self.ctx.logs_dir.is_dir() {
            return Ok(());
        }

        let mut sources: Vec<PathBuf> = WalkDir::new(&self.ctx.logs_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|x| x == "log").unwrap_or(false))
            .map(|e| e.into_path())
            .collect();
        sources.sort();

        for source in sources {
            let offset = self.offsets.get(&source).copied().unwrap_or(0);
            let chunk = match read_from(&source, offset).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::trace!(path = %source.display(), "Skipping log: {}", e);
                    continue;
                }
            };
            if chunk.is_empty() {
                continue;
            }

            if self.last_source.as_ref() != Some(&source) {
                let relative = source.strip_prefix(&self.ctx.logs_dir).unwrap_or(&source);
                let header = format!("\n==> {} <==\n", relative.display());
                self.write(header.as_bytes()).await?;
                self.last_source = Some(source.clone());
            }
            self.write(&chunk).await?;
            self.offsets.insert(source, offset + chunk.len() as u64);
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ArtifactCaptureError> {
        self.output
            .write_all(bytes)
            .await
            .map_err(|e| ArtifactCaptureError::backend(BACKEND, e))?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

async fn read_from(path: &std::path::Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    // Rotated or truncated: start over
    let offset = if len < offset { 0 } else { offset };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl ActiveCapture for ActiveLogTail {
    async fn on_event(&mut self, event: &CaptureEvent) -> Result<(), ArtifactCaptureError> {
        match event {
            CaptureEvent::StepStarted { .. } => Ok(()),
            CaptureEvent::StepFinished { .. } | CaptureEvent::Snapshot { .. } => {
                self.poll_logs().await?;
                self.output
                    .flush()
                    .await
                    .map_err(|e| ArtifactCaptureError::backend(BACKEND, e))
            }
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.poll)
    }

    async fn tick(&mut self) -> Result<(), ArtifactCaptureError> {
        self.poll_logs().await
    }

    async fn finish(self: Box<Self>) -> Result<Vec<Artifact>, ArtifactCaptureError> {
        let mut this = self;
        this.poll_logs().await?;
        this.output
            .sync_all()
            .await
            .map_err(|e| ArtifactCaptureError::backend(BACKEND, e))?;

        if this.written == 0 {
            let _ = tokio::fs::remove_file(&this.output_path).await;
            return Ok(Vec::new());
        }
        let artifact = this
            .ctx
            .artifact(ArtifactKind::Log, this.output_path.clone(), "tail", None);
        Ok(vec![artifact])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tails_only_new_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs/20260101T000000/window1");
        std::fs::create_dir_all(&logs).unwrap();
        let renderer = logs.join("renderer.log");
        std::fs::write(&renderer, "boot\n").unwrap();

        let ctx = CaptureContext {
            run_id: "run-1".into(),
            artifacts_dir: dir.path().to_path_buf(),
            logs_dir: dir.path().join("logs"),
            driver: None,
        };
        let backend = LogTailCapture::new(Duration::from_millis(50));
        let mut active = backend.start(&ctx).await.unwrap();
        active.tick().await.unwrap();

        std::fs::write(&renderer, "boot\nopened file\n").unwrap();
        let artifacts = active.finish().await.unwrap();

        assert_eq!(artifacts.len(), 1);
        let content = std::fs::read_to_string(&artifacts[0].path).unwrap();
        assert_eq!(content.matches("boot").count(), 1);
        assert!(content.contains("opened file"));
        assert!(content.contains("renderer.log"));
    }

    #[tokio::test]
    async fn test_no_logs_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CaptureContext {
            run_id: "run-1".into(),
            artifacts_dir: dir.path().to_path_buf(),
            logs_dir: dir.path().join("missing"),
            driver: None,
        };
        let active = LogTailCapture::new(Duration::from_millis(50))
            .start(&ctx)
            .await
            .unwrap();
        assert!(active.finish().await.unwrap().is_empty());
    }
}
