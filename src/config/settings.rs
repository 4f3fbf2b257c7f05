//! Worker settings.
//!
//! Settings are persisted to `<config dir>/mailmirror/settings.json` (XDG or
//! platform equivalent) and loaded at startup. A missing file yields
//! defaults; unknown or missing fields fall back per section.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::email::{RetryPolicy, GMAIL_API_BASE, GOOGLE_TOKEN_URL};

/// Errors reading or writing the settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no home directory to resolve the config path")]
    NoConfigDir,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level worker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Remote API endpoints and OAuth client.
    pub gmail: GmailSettings,
    /// Connector retry and listing behaviour.
    pub sync: SyncSettings,
    /// Task dispatch.
    pub tasks: TaskSettings,
    /// Database and attachment locations.
    pub storage: StorageSettings,
    /// Log filter.
    pub logging: LoggingSettings,
}

/// Remote API configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    /// API root for the authenticated user.
    pub api_base: String,
    /// OAuth token endpoint.
    pub token_url: String,
    /// OAuth client id. The secret lives in the keychain.
    pub client_id: String,
    /// Page size for list and history calls.
    pub list_page_size: u32,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            api_base: GMAIL_API_BASE.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            client_id: String::new(),
            list_page_size: 500,
        }
    }
}

/// Connector behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Attempts per remote call before giving up on transient errors.
    pub max_attempts: u32,
    /// Backoff unit in milliseconds.
    pub backoff_unit_ms: u64,
    /// Attempts for label add/remove against a refreshed view.
    pub label_update_attempts: u32,
    /// Listing query that excludes chat items.
    pub excluded_query: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff_unit_ms: 1000,
            label_update_attempts: 6,
            excluded_query: "-in:chats".to_string(),
        }
    }
}

impl SyncSettings {
    /// Retry policy for the connector.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
        }
    }
}

/// Task dispatch behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Retries after the first failed run of a task.
    pub max_retries: u32,
    /// Base delay between retries; retry `n` waits `n * retry_delay_secs`.
    pub retry_delay_secs: u64,
    /// Tasks run concurrently by the worker.
    pub concurrency: usize,
    /// Seconds between scheduler passes over all accounts.
    pub poll_interval_secs: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 30,
            concurrency: 4,
            poll_interval_secs: 300,
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite path. Defaults to `<data dir>/mirror.db`.
    pub database_path: Option<PathBuf>,
    /// Attachment directory. Defaults to `<data dir>/attachments`.
    pub attachments_dir: Option<PathBuf>,
    /// URL template for inline attachment references; `{id}` is replaced
    /// with the attachment id.
    pub attachment_url_template: Option<String>,
}

/// Default attachment URL template.
pub const DEFAULT_ATTACHMENT_URL_TEMPLATE: &str = "/api/messaging/attachments/{id}";

impl StorageSettings {
    /// Effective attachment URL template.
    pub fn attachment_url_template(&self) -> &str {
        self.attachment_url_template
            .as_deref()
            .unwrap_or(DEFAULT_ATTACHMENT_URL_TEMPLATE)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Settings {
    fn project_dirs() -> Result<ProjectDirs, SettingsError> {
        ProjectDirs::from("io", "mailmirror", "mailmirror").ok_or(SettingsError::NoConfigDir)
    }

    /// Default settings file location.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        Ok(Self::project_dirs()?.config_dir().join("settings.json"))
    }

    /// Loads settings from `path`, returning defaults if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads settings from the default location.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Writes settings as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    /// Resolved database path.
    pub fn database_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("mirror.db")),
        }
    }

    /// Resolved attachment directory.
    pub fn attachments_dir(&self) -> Result<PathBuf, SettingsError> {
        match &self.storage.attachments_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("attachments")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.sync.max_attempts, 6);
        assert_eq!(settings.sync.label_update_attempts, 6);
        assert_eq!(settings.sync.excluded_query, "-in:chats");
        assert_eq!(settings.tasks.max_retries, 3);
        assert_eq!(settings.logging.filter, "info");
        assert_eq!(
            settings.storage.attachment_url_template(),
            "/api/messaging/attachments/{id}"
        );
    }

    #[test]
    fn retry_policy_from_settings() {
        let sync = SyncSettings {
            max_attempts: 0,
            backoff_unit_ms: 250,
            ..Default::default()
        };
        let policy = sync.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_unit, Duration::from_millis(250));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let json = r#"{"gmail": {"client_id": "abc.apps.googleusercontent.com"}, "tasks": {"max_retries": 5}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.gmail.client_id, "abc.apps.googleusercontent.com");
        assert_eq!(settings.gmail.api_base, GMAIL_API_BASE);
        assert_eq!(settings.tasks.max_retries, 5);
        assert_eq!(settings.tasks.retry_delay_secs, 30);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.storage.database_path = Some(dir.path().join("db.sqlite"));
        settings.logging.filter = "mailmirror=debug".to_string();
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.database_path().unwrap(), dir.path().join("db.sqlite"));
    }

    #[test]
    fn invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            Settings::load_from(&path),
            Err(SettingsError::Parse { .. })
        ));
    }
}
