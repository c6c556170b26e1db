//! Configuration and workspace paths

use std::path::PathBuf;

/// Name used for the configuration directory
const APP_NAME: &str = "cli-harness";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/cli-harness/`
/// - macOS: `~/Library/Application Support/cli-harness/`
/// - Windows: `%APPDATA%\cli-harness\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Parent directory for scenario workspaces when none is configured
pub fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join(APP_NAME)
}
