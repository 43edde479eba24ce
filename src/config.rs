//! Daemon Configuration
//!
//! Loads and saves the daemon's configuration from `~/.metamorph/config.json`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Config file name within the data directory.
const CONFIG_FILENAME: &str = "config.json";

/// Directory under the user's home that holds all persisted state.
const DATA_DIR_NAME: &str = ".metamorph";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Daemon configuration. Unknown fields in the JSON document are ignored
/// on read so the file stays forward-compatible with hand edits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    pub name: String,
    /// Trust-boundary root. No mutation ever lands outside this tree.
    pub sandbox_root: String,
    /// Directory holding the ledgers, snapshots, backups and lock file.
    pub data_dir: String,
    /// Working tree the self-updater pulls and rebuilds.
    pub repo_path: String,
    /// Process name handed to the supervisor for detached restarts.
    pub process_name: String,
    /// Cron expression for the improvement cycle trigger.
    pub cycle_schedule: String,
    /// Whether a cycle starts with a self-update check.
    pub auto_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub log_level: LogLevel,
    pub version: String,
}

/// Returns a default `DaemonConfig`. Fields with no sensible default are
/// empty strings so callers can override them.
pub fn default_config() -> DaemonConfig {
    DaemonConfig {
        name: String::new(),
        sandbox_root: "~/metamorph-workspace".to_string(),
        data_dir: "~/.metamorph".to_string(),
        repo_path: ".".to_string(),
        process_name: "metamorph".to_string(),
        cycle_schedule: "0 0 */6 * * *".to_string(),
        auto_update: true,
        webhook_url: None,
        log_level: LogLevel::Info,
        version: "0.1.0".to_string(),
    }
}

/// Returns the full path to the config file: `~/.metamorph/config.json`.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join(CONFIG_FILENAME)
}

/// Returns the data directory path: `~/.metamorph`.
pub fn get_data_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    home.join(DATA_DIR_NAME)
}

/// Load the daemon config from disk.
///
/// Reads `~/.metamorph/config.json` and merges missing fields with
/// defaults. Returns `None` if the file does not exist or cannot be
/// parsed.
pub fn load_config() -> Option<DaemonConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let mut config: DaemonConfig = serde_json::from_str(&contents).ok()?;

    // Merge defaults for unset fields
    let defaults = default_config();

    if config.sandbox_root.is_empty() {
        config.sandbox_root = defaults.sandbox_root;
    }
    if config.data_dir.is_empty() {
        config.data_dir = defaults.data_dir;
    }
    if config.repo_path.is_empty() {
        config.repo_path = defaults.repo_path;
    }
    if config.process_name.is_empty() {
        config.process_name = defaults.process_name;
    }
    if config.cycle_schedule.is_empty() {
        config.cycle_schedule = defaults.cycle_schedule;
    }
    if config.version.is_empty() {
        config.version = defaults.version;
    }

    Some(config)
}

/// Save the daemon config to disk at `~/.metamorph/config.json`.
///
/// Creates the data directory with mode 0o700 if it does not exist. The
/// config file is written with mode 0o600 since it may contain a webhook
/// URL with an embedded token.
pub fn save_config(config: &DaemonConfig) -> Result<()> {
    let dir = get_data_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create data directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let config_path = get_config_path();
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(&config_path, &json).context("Failed to write config file")?;
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
///
/// If the path starts with `~`, the tilde is replaced with the user's
/// home directory. Otherwise the path is returned as-is.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_with_tilde() {
        let resolved = resolve_path("~/some/path");
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with("some/path"));
    }

    #[test]
    fn test_resolve_path_without_tilde() {
        let path = "/absolute/path/to/file";
        assert_eq!(resolve_path(path), path);
    }

    #[test]
    fn test_default_config_values() {
        let config = default_config();
        assert_eq!(config.process_name, "metamorph");
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.auto_update);
        assert_eq!(config.version, "0.1.0");
    }

    #[test]
    fn test_config_tolerates_unknown_fields() {
        let json = r#"{
            "name": "m1",
            "sandboxRoot": "/tmp/ws",
            "dataDir": "/tmp/data",
            "repoPath": ".",
            "processName": "metamorph",
            "cycleSchedule": "0 0 * * * *",
            "autoUpdate": false,
            "logLevel": "info",
            "version": "0.1.0",
            "someFutureField": 42
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "m1");
        assert!(!config.auto_update);
    }
}
