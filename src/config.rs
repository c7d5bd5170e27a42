//! Application configuration
//!
//! Compile-time constants grouped by concern, plus the runtime [`Settings`]
//! loaded from `settings.json` in the user's config directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::{get_cache_dir, get_config_dir};
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "config";

pub mod app {
    /// Application name, used for cache and config directories
    pub const NAME: &str = "cordatus-flash";
    /// HTTP user agent for artifact downloads
    pub const USER_AGENT: &str = concat!("Cordatus-Flash/", env!("CARGO_PKG_VERSION"));
    /// Settings file name inside the config directory
    pub const SETTINGS_FILE: &str = "settings.json";
    /// Default compatibility table file name inside the config directory
    pub const TABLE_FILE: &str = "compatibility.json";
}

pub mod download {
    /// Read/write chunk size for hashing downloaded files
    pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;
    /// Suffix of in-progress downloads; never treated as a valid artifact
    pub const PARTIAL_SUFFIX: &str = ".part";
    /// Automatic retries for a transient download failure
    pub const MAX_RETRIES: u32 = 3;
    /// Initial backoff between download retries, doubled on each attempt
    pub const RETRY_BACKOFF_MS: u64 = 2_000;
    /// Connect timeout for artifact requests
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
}

pub mod logging {
    /// Log download progress every N megabytes
    pub const DOWNLOAD_LOG_INTERVAL_MB: u64 = 100;
    /// Log hashing progress every N megabytes
    pub const SHA_LOG_INTERVAL_MB: u64 = 500;
}

pub mod session {
    /// Lines of tool output kept for failure diagnostics
    pub const OUTPUT_TAIL_LINES: usize = 20;
    /// Buffered lines between a child process and its progress bridge
    pub const LINE_CHANNEL_CAPACITY: usize = 1024;
}

pub mod cache {
    /// Directory holding downloaded archives inside a version subtree
    pub const DOWNLOADS_DIR: &str = "downloads";
    /// Directory archives are extracted into inside a version subtree
    pub const TREE_DIR: &str = "tree";
    /// Directory holding per-archive extraction markers
    pub const MARKERS_DIR: &str = ".markers";
    /// Subtree-level marker: `downloaded` or `extracted`
    pub const STATE_MARKER: &str = ".cache-state";
    /// Prefix for subtrees renamed away before deletion
    pub const TRASH_PREFIX: &str = ".trash-";
}

/// Runtime settings
///
/// Every field has a default so a partial `settings.json` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the archive cache
    pub cache_root: PathBuf,
    /// Compatibility table (JSON)
    pub table_path: PathBuf,
    /// Optional family rules file replacing the built-in rules
    pub rules_path: Option<PathBuf>,
    /// Command used to elevate privileged steps, empty to run them directly
    pub privilege_command: Vec<String>,
    /// Automatic download retries
    pub download_retries: u32,
    /// Initial retry backoff in milliseconds
    pub retry_backoff_ms: u64,
    /// Lines of tool output attached to failure reports
    pub output_tail_lines: usize,
    /// Stop udisks2 before flashing so it does not grab the device's partitions
    pub stop_automount: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let config_dir = get_config_dir(app::NAME);
        Self {
            cache_root: get_cache_dir(app::NAME).join("archives"),
            table_path: config_dir.join(app::TABLE_FILE),
            rules_path: None,
            privilege_command: vec!["sudo".to_string(), "-n".to_string(), "-E".to_string()],
            download_retries: download::MAX_RETRIES,
            retry_backoff_ms: download::RETRY_BACKOFF_MS,
            output_tail_lines: session::OUTPUT_TAIL_LINES,
            stop_automount: true,
        }
    }
}

impl Settings {
    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        let path = get_config_dir(app::NAME).join(app::SETTINGS_FILE);
        match Self::load_from(&path) {
            Ok(Some(settings)) => {
                log_info!(MODULE, "Loaded settings from {}", path.display());
                settings
            }
            Ok(None) => {
                log_debug!(MODULE, "No settings file at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                log_warn!(MODULE, "{}. Using default settings.", e);
                Self::default()
            }
        }
    }

    /// Load settings from a specific file; `Ok(None)` if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let settings = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Initial delay before the first download retry
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "download_retries": 7, "stop_automount": false }"#).unwrap();

        let settings = Settings::load_from(&path).unwrap().unwrap();
        assert_eq!(settings.download_retries, 7);
        assert!(!settings.stop_automount);
        assert_eq!(settings.output_tail_lines, session::OUTPUT_TAIL_LINES);
        assert_eq!(settings.privilege_command, vec!["sudo", "-n", "-E"]);
    }

    #[test]
    fn test_missing_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load_from(&dir.path().join("nope.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }
}
