//! Concurrent capture session
//!
//! Every backend runs on its own task fed by an unbounded channel, so
//! notifying the capture timeline never waits on a slow recorder.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use super::{ActiveCapture, Artifact, CaptureBackend, CaptureContext, CaptureEvent};

/// Artifacts and warnings of a stopped session
#[derive(Debug, Default, Clone)]
pub struct CaptureReport {
    pub artifacts: Vec<Artifact>,
    pub warnings: Vec<String>,
}

enum Command {
    Event(CaptureEvent),
    Snapshot {
        event: CaptureEvent,
        ack: oneshot::Sender<()>,
    },
}

struct BackendTask {
    name: &'static str,
    tx: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<CaptureReport>,
}

/// Capture for one run
pub struct CaptureSession {
    tasks: Vec<BackendTask>,
    warnings: Vec<String>,
}

impl CaptureSession {
    /// Start every backend; backends that fail to start become warnings
    pub async fn start(backends: &[Arc<dyn CaptureBackend>], ctx: &CaptureContext) -> Self {
        let mut tasks = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = tokio::fs::create_dir_all(&ctx.artifacts_dir).await {
            warnings.push(format!(
                "cannot create artifact dir {}: {}",
                ctx.artifacts_dir.display(),
                e
            ));
            return Self { tasks, warnings };
        }

        for backend in backends {
            match backend.start(ctx).await {
                Ok(active) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let name = backend.name();
                    let handle = tokio::spawn(drive_backend(name, active, rx));
                    tasks.push(BackendTask { name, tx, handle });
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), "{}", e);
                    warnings.push(e.to_string());
                }
            }
        }

        Self { tasks, warnings }
    }

    /// Session with no backends, for runs without artifacts
    pub fn disabled() -> Self {
        Self {
            tasks: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn step_started(&self, index: usize) {
        self.broadcast(CaptureEvent::StepStarted { index });
    }

    pub fn step_finished(&self, index: usize, status: &str) {
        self.broadcast(CaptureEvent::StepFinished {
            index,
            status: status.to_string(),
        });
    }

    fn broadcast(&self, event: CaptureEvent) {
        for task in &self.tasks {
            // A closed channel means the backend already gave up
            let _ = task.tx.send(Command::Event(event.clone()));
        }
    }

    /// Capture evidence now and wait, up to `timeout`, until every backend has
    /// written it
    pub async fn snapshot(&mut self, reason: &str, step_index: Option<usize>, timeout: Duration) {
        let mut acks = Vec::new();
        for task in &self.tasks {
            let (ack, rx) = oneshot::channel();
            let event = CaptureEvent::Snapshot {
                reason: reason.to_string(),
                step_index,
            };
            if task.tx.send(Command::Snapshot { event, ack }).is_ok() {
                acks.push((task.name, rx));
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, rx) in acks {
            if tokio::time::timeout_at(deadline, rx).await.is_err() {
                self.warnings
                    .push(format!("{} capture did not finish snapshot '{}' in time", name, reason));
            }
        }
    }

    /// Flush and close every backend, waiting at most `timeout` overall
    ///
    /// Backends still busy at the deadline are aborted and their artifacts
    /// lost; the run goes on to teardown regardless.
    pub async fn stop(self, timeout: Duration) -> CaptureReport {
        let mut report = CaptureReport {
            artifacts: Vec::new(),
            warnings: self.warnings,
        };

        // Closing every channel first lets the backends flush side by side
        let running: Vec<_> = self
            .tasks
            .into_iter()
            .map(|task| (task.name, task.handle))
            .collect();

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, mut handle) in running {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(backend_report)) => {
                    report.artifacts.extend(backend_report.artifacts);
                    report.warnings.extend(backend_report.warnings);
                }
                Ok(Err(e)) => report
                    .warnings
                    .push(format!("{} capture task crashed: {}", name, e)),
                Err(_) => {
                    handle.abort();
                    tracing::warn!(backend = name, "Capture did not stop in time, aborted");
                    report.warnings.push(format!(
                        "{} capture did not stop within {}ms and was aborted",
                        name,
                        timeout.as_millis()
                    ));
                }
            }
        }

        report.artifacts.sort_by_key(|a| a.captured_at);
        report
    }
}

async fn drive_backend(
    name: &'static str,
    mut active: Box<dyn ActiveCapture>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) -> CaptureReport {
    let mut report = CaptureReport::default();
    let mut ticker = active.tick_interval().filter(|d| !d.is_zero()).map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Event(event)) => {
                    if let Err(e) = active.on_event(&event).await {
                        tracing::warn!(backend = name, "{}", e);
                        report.warnings.push(e.to_string());
                    }
                }
                Some(Command::Snapshot { event, ack }) => {
                    if let Err(e) = active.on_event(&event).await {
                        tracing::warn!(backend = name, "{}", e);
                        report.warnings.push(e.to_string());
                    }
                    let _ = ack.send(());
                }
                None => break,
            },
            _ = next_tick(&mut ticker) => {
                if let Err(e) = active.tick().await {
                    tracing::debug!(backend = name, "{}", e);
                    report.warnings.push(e.to_string());
                }
            }
        }
    }

    match active.finish().await {
        Ok(artifacts) => report.artifacts = artifacts,
        Err(e) => {
            tracing::warn!(backend = name, "{}", e);
            report.warnings.push(e.to_string());
        }
    }
    report.warnings.dedup();
    report
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
