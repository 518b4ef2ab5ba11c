//! Application settings management

use crate::PathManager;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Override for the local store location (defaults to `PathManager::db_path`)
    pub db_path: Option<String>,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Tuning for the capture engine. Every field has a default, so a partial
/// `[sync]` table is fine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Quiet period before a burst of page mutations becomes one change signal
    pub debounce_ms: u64,
    /// Upper bound on a single round-trip to the privileged store
    pub remote_timeout_ms: u64,
    /// External ids a platform uses before it has assigned a real one
    pub placeholder_ids: Vec<String>,
    /// Waiting for the page to render its first messages
    pub extraction: RetrySettings,
    /// Liveness check of the privileged channel
    pub liveness: RetrySettings,
    /// Retries of one store call before falling back to the local store
    pub per_call: RetrySettings,
    /// Outermost resolve-and-attach attempts at startup
    pub boot: RetrySettings,
}

/// Linear backoff: the n-th retry waits `step_ms * n`, clamped to `cap_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub step_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_ms: Option<u64>,
}

impl RetrySettings {
    pub const fn linear(max_attempts: u32, step_ms: u64) -> Self {
        Self {
            max_attempts,
            step_ms,
            cap_ms: None,
        }
    }

    pub const fn capped(max_attempts: u32, step_ms: u64, cap_ms: u64) -> Self {
        Self {
            max_attempts,
            step_ms,
            cap_ms: Some(cap_ms),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            remote_timeout_ms: 5000,
            placeholder_ids: vec!["new".to_string(), "new-chat".to_string()],
            extraction: RetrySettings::linear(3, 1000),
            liveness: RetrySettings::capped(3, 500, 3000),
            per_call: RetrySettings::linear(3, 500),
            boot: RetrySettings::linear(5, 1000),
        }
    }
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

impl Settings {
    /// Load settings from the settings file, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = PathManager::settings_path() else {
            return Self::default();
        };
        Self::load_from(&path)
    }

    /// Load settings from an explicit path, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };

        toml::from_str(&content).unwrap_or_default()
    }

    /// Effective database path: explicit setting first, then the platform default
    pub fn db_path(&self) -> Option<std::path::PathBuf> {
        self.db_path
            .as_ref()
            .map(std::path::PathBuf::from)
            .or_else(PathManager::db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_sync_table_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [sync]
            debounce_ms = 1200

            [sync.boot]
            max_attempts = 2
            step_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(settings.sync.debounce_ms, 1200);
        assert_eq!(settings.sync.boot, RetrySettings::linear(2, 250));
        assert_eq!(settings.sync.liveness, RetrySettings::capped(3, 500, 3000));
        assert_eq!(settings.sync.placeholder_ids, vec!["new", "new-chat"]);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("chatsync-settings-does-not-exist.toml");
        assert_eq!(Settings::load_from(&path), Settings::default());
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!(
            "chatsync-settings-malformed-{}.toml",
            std::process::id()
        ));
        fs::write(&path, "[sync\ndebounce_ms = ").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut settings = Settings::default();
        settings.db_path = Some("/tmp/chats.db".to_string());
        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
