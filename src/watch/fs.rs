//! File system events for watch mode

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc;

use super::WatchEvent;
use crate::common::paths::is_scenario_file;
use crate::common::Result;

/// Scenario files touched by a notify event
fn scenario_changes(event: &Event) -> Vec<PathBuf> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| is_scenario_file(p))
        .cloned()
        .collect()
}

/// Watch `paths` recursively and forward scenario file changes to `events`
///
/// The watcher stops when it is dropped, so the caller must hold it for
/// as long as events are wanted.
pub fn spawn_watcher(
    paths: &[PathBuf],
    events: mpsc::UnboundedSender<WatchEvent>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in scenario_changes(&event) {
                // Receiver gone means watch mode is shutting down
                let _ = events.send(WatchEvent::Changed(path));
            }
        }
        Err(e) => tracing::warn!("File watcher error: {}", e),
    })?;

    for path in paths {
        watcher.watch(path, RecursiveMode::Recursive)?;
        tracing::debug!(path = %path.display(), "Watching");
    }

    Ok(watcher)
}
