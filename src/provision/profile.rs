//! Profile preparation for each isolation mode
//!
//! A named profile lives under `<profiles root>/<name>/`:
//!
//! ```text
//! <name>/baseline/        known-clean snapshot, maintained by hand
//! <name>/active/          long-lived state used by reuse mode
//! <name>/runs/<run>/      one sandbox per sandbox-reset acquisition
//! ```
//!
//! Sandbox reset copies `baseline/` into a directory of its own, so runs of
//! the same profile never see each other's state; the directory is removed on
//! release. Reuse mode shares `active/` and takes the profile's lock for the
//! lifetime of the handle. Fresh profiles live in a temp dir removed on
//! release.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use walkdir::WalkDir;

use super::IsolationMode;

/// Directories handed to the editor
#[derive(Debug)]
pub struct PreparedProfile {
    pub name: String,
    pub user_data_dir: PathBuf,
    pub extensions_dir: PathBuf,
    /// Set for fresh and sandboxed profiles; dropping it deletes the profile
    pub temp: Option<TempDir>,
}

/// Prepare a profile directory for the given isolation mode
pub fn prepare_profile(mode: IsolationMode, root: &Path, name: &str) -> io::Result<PreparedProfile> {
    match mode {
        IsolationMode::FreshProfile => {
            let temp = tempfile::Builder::new().prefix("uxtest-profile-").tempdir()?;
            owned_layout("fresh", temp)
        }
        IsolationMode::SandboxReset => {
            let profile_root = root.join(name);
            let runs = profile_root.join("runs");
            fs::create_dir_all(&runs)?;
            let sandbox = tempfile::Builder::new().prefix("run-").tempdir_in(&runs)?;

            let baseline = profile_root.join("baseline");
            if baseline.is_dir() {
                copy_tree(&baseline, sandbox.path())?;
            } else {
                tracing::debug!(profile = name, "No baseline snapshot, starting from empty profile");
            }
            owned_layout(name, sandbox)
        }
        IsolationMode::Reuse => {
            let prepared = layout(name, &root.join(name).join("active"));
            fs::create_dir_all(&prepared.user_data_dir)?;
            fs::create_dir_all(&prepared.extensions_dir)?;
            Ok(prepared)
        }
    }
}

/// Profile whose directory is deleted with `temp`
fn owned_layout(name: &str, temp: TempDir) -> io::Result<PreparedProfile> {
    let prepared = layout(name, temp.path());
    fs::create_dir_all(&prepared.user_data_dir)?;
    fs::create_dir_all(&prepared.extensions_dir)?;
    Ok(PreparedProfile {
        temp: Some(temp),
        ..prepared
    })
}

fn layout(name: &str, dir: &Path) -> PreparedProfile {
    PreparedProfile {
        name: name.to_string(),
        user_data_dir: dir.join("user-data"),
        extensions_dir: dir.join("extensions"),
        temp: None,
    }
}

/// One lock per reused profile name
#[derive(Default)]
pub struct ProfileLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProfileLocks {
    /// Wait until no other handle holds the named profile
    pub async fn hold(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Recursively copy `from` into the existing directory `to`
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn with_baseline() -> TempDir {
        let root = TempDir::new().unwrap();
        let baseline = root.path().join("work/baseline/user-data/User");
        fs::create_dir_all(&baseline).unwrap();
        fs::write(baseline.join("settings.json"), "{}").unwrap();
        root
    }

    #[test]
    fn test_sandbox_reset_restores_baseline() {
        let root = with_baseline();
        let first = prepare_profile(IsolationMode::SandboxReset, root.path(), "work").unwrap();
        let sandbox = first.user_data_dir.clone();
        fs::write(sandbox.join("User/stray.json"), "leftover").unwrap();
        drop(first);
        assert!(!sandbox.exists());

        let second = prepare_profile(IsolationMode::SandboxReset, root.path(), "work").unwrap();
        assert!(second.user_data_dir.join("User/settings.json").exists());
        assert!(!second.user_data_dir.join("User/stray.json").exists());
    }

    #[test]
    fn test_live_sandboxes_do_not_share_state() {
        let root = with_baseline();
        let a = prepare_profile(IsolationMode::SandboxReset, root.path(), "work").unwrap();
        fs::write(a.user_data_dir.join("User/state.json"), "run a").unwrap();

        let b = prepare_profile(IsolationMode::SandboxReset, root.path(), "work").unwrap();
        assert_ne!(a.user_data_dir, b.user_data_dir);
        assert_eq!(
            fs::read_to_string(a.user_data_dir.join("User/state.json")).unwrap(),
            "run a"
        );
        assert!(b.user_data_dir.join("User/settings.json").exists());
        assert!(!b.user_data_dir.join("User/state.json").exists());

        drop(b);
        assert!(a.user_data_dir.join("User/state.json").exists());
    }

    #[test]
    fn test_reuse_keeps_state() {
        let root = TempDir::new().unwrap();
        let first = prepare_profile(IsolationMode::Reuse, root.path(), "work").unwrap();
        fs::write(first.user_data_dir.join("state"), "kept").unwrap();
        let second = prepare_profile(IsolationMode::Reuse, root.path(), "work").unwrap();
        assert!(second.user_data_dir.join("state").exists());
    }

    #[test]
    fn test_fresh_profile_is_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let fresh = prepare_profile(IsolationMode::FreshProfile, root.path(), "ignored").unwrap();
        let dir = fresh.user_data_dir.clone();
        assert!(dir.exists());
        assert_eq!(fresh.name, "fresh");
        drop(fresh);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_reused_profile_is_held_by_one_handle() {
        let locks = ProfileLocks::default();
        let held = locks.hold("work").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.hold("work")).await;
        assert!(blocked.is_err());
        let other = tokio::time::timeout(Duration::from_millis(50), locks.hold("other")).await;
        assert!(other.is_ok());

        drop(held);
        let released = tokio::time::timeout(Duration::from_millis(50), locks.hold("work")).await;
        assert!(released.is_ok());
    }
}
