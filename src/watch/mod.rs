//! Watch mode supervisor
//!
//! Turns a stream of file-change events into reruns. Bursts of changes
//! inside the debounce window collapse into one rerun; a rerun never starts
//! while the previous one is still tearing down.

pub mod fs;

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Something that should cause a rerun
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A scenario source file changed
    Changed(PathBuf),
    /// Rerun without a file change, e.g. on startup
    Requested,
}

/// What a watch session did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub runs_started: usize,
    /// In-flight runs cancelled by a rerun or by shutdown
    pub runs_cancelled: usize,
}

struct InFlight {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl InFlight {
    /// Cancel (if still running) and wait until teardown is complete
    async fn cancel_and_join(self, summary: &mut WatchSummary) {
        if !self.handle.is_finished() {
            tracing::info!("Cancelling in-flight run");
            self.cancel.cancel();
            summary.runs_cancelled += 1;
        }
        if let Err(e) = self.handle.await {
            tracing::error!("Watched run crashed: {}", e);
        }
    }
}

pub struct WatchController {
    debounce: Duration,
}

impl WatchController {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce }
    }

    /// Supervise reruns until `shutdown` fires or the event stream ends
    ///
    /// `trigger` receives the changed paths and the cancellation token of the
    /// run it starts. On shutdown the in-flight run is cancelled; when the
    /// event stream ends it is allowed to finish.
    pub async fn run<F, Fut>(
        &self,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        shutdown: CancellationToken,
        mut trigger: F,
    ) -> WatchSummary
    where
        F: FnMut(Vec<PathBuf>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut summary = WatchSummary::default();
        let mut in_flight: Option<InFlight> = None;
        let mut changed: BTreeSet<PathBuf> = BTreeSet::new();
        let mut deadline: Option<Instant> = None;
        let mut open = true;

        loop {
            if !open && deadline.is_none() {
                break;
            }

            let debounce_elapsed = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    if let Some(run) = in_flight.take() {
                        run.cancel_and_join(&mut summary).await;
                    }
                    tracing::info!(?summary, "Watch stopped");
                    return summary;
                }

                event = events.recv(), if open => match event {
                    Some(event) => {
                        tracing::debug!(?event, "Change detected");
                        if let WatchEvent::Changed(path) = event {
                            changed.insert(path);
                        }
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    None => open = false,
                },

                _ = debounce_elapsed => {
                    deadline = None;
                    if let Some(run) = in_flight.take() {
                        run.cancel_and_join(&mut summary).await;
                    }
                    let paths: Vec<PathBuf> = std::mem::take(&mut changed).into_iter().collect();
                    tracing::info!(changed = paths.len(), "Starting rerun");

                    let cancel = shutdown.child_token();
                    let handle = tokio::spawn(trigger(paths, cancel.clone()));
                    in_flight = Some(InFlight { cancel, handle });
                    summary.runs_started += 1;
                }
            }
        }

        if let Some(run) = in_flight.take() {
            if let Err(e) = run.handle.await {
                tracing::error!("Watched run crashed: {}", e);
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const DEBOUNCE: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn test_burst_triggers_one_rerun() {
        let (tx, rx) = mpsc::unbounded_channel();
        let runs = Arc::new(Mutex::new(Vec::new()));

        let recorded = runs.clone();
        let controller = tokio::spawn(async move {
            WatchController::new(DEBOUNCE)
                .run(rx, CancellationToken::new(), move |paths, _| {
                    recorded.lock().unwrap().push(paths);
                    async {}
                })
                .await
        });

        tx.send(WatchEvent::Changed("a.yaml".into())).unwrap();
        tx.send(WatchEvent::Changed("b.yaml".into())).unwrap();
        tx.send(WatchEvent::Changed("a.yaml".into())).unwrap();
        tokio::time::sleep(DEBOUNCE * 5).await;
        drop(tx);

        let summary = controller.await.unwrap();
        assert_eq!(summary.runs_started, 1);
        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0], vec![PathBuf::from("a.yaml"), PathBuf::from("b.yaml")]);
    }

    #[tokio::test]
    async fn test_rerun_cancels_in_flight_run_first() {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let log = Arc::new(Mutex::new(Vec::<String>::new()));

        let recorded = log.clone();
        let stop = shutdown.clone();
        let mut count = 0;
        let controller = tokio::spawn(async move {
            WatchController::new(DEBOUNCE)
                .run(rx, stop, move |_, cancel| {
                    count += 1;
                    let n = count;
                    let log = recorded.clone();
                    async move {
                        log.lock().unwrap().push(format!("start {}", n));
                        cancel.cancelled().await;
                        // Teardown takes a while; the next run must wait for it
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        log.lock().unwrap().push(format!("stop {}", n));
                    }
                })
                .await
        });

        tx.send(WatchEvent::Requested).unwrap();
        tokio::time::sleep(DEBOUNCE * 4).await;
        tx.send(WatchEvent::Changed("a.yaml".into())).unwrap();
        tokio::time::sleep(DEBOUNCE * 4).await;
        shutdown.cancel();

        let summary = controller.await.unwrap();
        assert_eq!(summary.runs_started, 2);
        assert_eq!(summary.runs_cancelled, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 1", "stop 1", "start 2", "stop 2"]
        );
    }

    #[tokio::test]
    async fn test_finished_run_is_not_counted_as_cancelled() {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(async move {
            WatchController::new(DEBOUNCE)
                .run(rx, CancellationToken::new(), |_, _| async {})
                .await
        });

        tx.send(WatchEvent::Requested).unwrap();
        tokio::time::sleep(DEBOUNCE * 4).await;
        tx.send(WatchEvent::Requested).unwrap();
        tokio::time::sleep(DEBOUNCE * 4).await;
        drop(tx);

        let summary = controller.await.unwrap();
        assert_eq!(summary.runs_started, 2);
        assert_eq!(summary.runs_cancelled, 0);
    }
}
