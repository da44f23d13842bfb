//! Configuration, log and profile locations
//!
//! Uses the directories crate for platform-appropriate locations:
//! - Linux: `~/.config/vscode-uxtest/`, `~/.local/share/vscode-uxtest/`
//! - macOS: `~/Library/Application Support/vscode-uxtest/`
//! - Windows: `%APPDATA%\vscode-uxtest\`

use std::path::PathBuf;

/// Application name used for all per-user directories
const APP_NAME: &str = "vscode-uxtest";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

/// Root directory for named editor profiles used by sandbox reset
///
/// Each profile lives in `<profiles>/<name>/` with a `baseline/` snapshot
/// and an `active/` copy handed to the editor.
pub fn profiles_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("profiles"))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME).join("profiles"))
}

/// Whether a path looks like a scenario source file
pub fn is_scenario_file(path: &std::path::Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
