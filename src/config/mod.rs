//! Configuration and settings management.
//!
//! Settings are stored in the user's config directory as JSON.

mod settings;

pub use settings::{
    GmailSettings, LoggingSettings, Settings, SettingsError, StorageSettings, SyncSettings,
    TaskSettings, DEFAULT_ATTACHMENT_URL_TEMPLATE,
};
