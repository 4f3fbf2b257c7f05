//! OAuth secret storage in the OS keychain.
//!
//! Refresh tokens are stored per account, the OAuth client secret once per
//! installation. Access tokens are short-lived and never persisted.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during keychain operations.
#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Failed to spawn blocking task: {0}")]
    TaskFailed(String),
}

/// Result type for keychain operations.
pub type Result<T> = std::result::Result<T, KeychainError>;

/// Key/value secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the secret stored under `key`, if any.
    async fn retrieve(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn store(&self, key: &str, value: &str) -> Result<()>;

    /// Removes the secret under `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Keychain key for an account's OAuth refresh token.
pub fn refresh_token_key(account_id: &str) -> String {
    format!("gmail.refresh_token.{}", account_id)
}

/// Keychain key for the OAuth client secret.
pub const CLIENT_SECRET_KEY: &str = "gmail.client_secret";

/// [`SecretStore`] backed by the platform keychain through `keyring`.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service_name: String,
}

impl KeychainAccess {
    /// Default keychain service namespace.
    pub const DEFAULT_SERVICE: &'static str = "io.mailmirror.worker";

    /// Creates a keychain handle with the default service name.
    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Creates a keychain handle with a custom service name.
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Returns the service name used for this keychain access.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn blocking<F, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(keyring::Entry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service_name.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            f(entry)
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for KeychainAccess {
    async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        self.blocking(key, |entry| match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeychainError::Keyring(e)),
        })
        .await
    }

    async fn store(&self, key: &str, value: &str) -> Result<()> {
        let value = value.to_string();
        self.blocking(key, move |entry| Ok(entry.set_password(&value)?))
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blocking(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        })
        .await
    }
}

/// Process-local [`SecretStore`], for tests and headless runs that inject
/// secrets from the environment.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.secrets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}
