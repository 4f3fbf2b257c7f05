//! OAuth access tokens for the Gmail API.
//!
//! Refresh tokens and the client secret come from a [`SecretStore`]; access
//! tokens are exchanged at the token endpoint and cached in memory until
//! shortly before they expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::AccountId;
use crate::storage::{refresh_token_key, KeychainError, SecretStore, CLIENT_SECRET_KEY};

/// Tokens are treated as expired this long before their stated expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Errors from obtaining an access token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no refresh token stored for account {0}")]
    MissingRefreshToken(String),

    #[error("no OAuth client secret stored")]
    MissingClientSecret,

    #[error("token endpoint rejected the refresh token ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error("invalid token response: {0}")]
    Decode(String),

    #[error(transparent)]
    Keychain(#[from] KeychainError),
}

impl TokenError {
    /// Whether the stored credentials themselves are unusable.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            TokenError::MissingRefreshToken(_)
                | TokenError::MissingClientSecret
                | TokenError::Rejected { .. }
        )
    }
}

/// Supplies bearer tokens for API requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a valid access token, refreshing if needed.
    async fn access_token(&self) -> Result<String, TokenError>;

    /// Drops any cached token so the next call refreshes.
    async fn invalidate(&self);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Refresh-token based [`TokenSource`] for one account.
pub struct OAuthTokenSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    account_id: AccountId,
    secrets: Arc<dyn SecretStore>,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthTokenSource {
    /// Creates a token source for `account_id`.
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        account_id: AccountId,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            account_id,
            secrets,
            cached: Mutex::new(None),
        }
    }

    async fn refresh(&self) -> Result<CachedToken, TokenError> {
        let refresh_token = self
            .secrets
            .retrieve(&refresh_token_key(self.account_id.as_str()))
            .await?
            .ok_or_else(|| TokenError::MissingRefreshToken(self.account_id.to_string()))?;
        let client_secret = self
            .secrets
            .retrieve(CLIENT_SECRET_KEY)
            .await?
            .ok_or(TokenError::MissingClientSecret)?;

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TokenError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 5xx from the token endpoint says nothing about the credentials.
            if status.is_server_error() {
                return Err(TokenError::Transport(format!("{status}: {body}")));
            }
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Decode(e.to_string()))?;

        tracing::debug!(account_id = %self.account_id, expires_in = token.expires_in, "refreshed access token");

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn access_token(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.refresh().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

/// A fixed token, for tests and short-lived tools.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }

    async fn invalidate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySecretStore;

    #[tokio::test]
    async fn missing_refresh_token_is_credential_failure() {
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.store(CLIENT_SECRET_KEY, "secret").await.unwrap();

        let source = OAuthTokenSource::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/token",
            "client",
            AccountId::from("acc"),
            secrets,
        );

        let err = source.access_token().await.unwrap_err();
        assert!(matches!(err, TokenError::MissingRefreshToken(ref id) if id == "acc"));
        assert!(err.is_credential_failure());
    }

    #[tokio::test]
    async fn missing_client_secret_is_credential_failure() {
        let secrets = Arc::new(MemorySecretStore::new());
        secrets
            .store(&refresh_token_key("acc"), "refresh")
            .await
            .unwrap();

        let source = OAuthTokenSource::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/token",
            "client",
            AccountId::from("acc"),
            secrets,
        );

        let err = source.access_token().await.unwrap_err();
        assert!(matches!(err, TokenError::MissingClientSecret));
    }

    #[test]
    fn transport_errors_are_not_credential_failures() {
        assert!(!TokenError::Transport("down".into()).is_credential_failure());
        assert!(TokenError::Rejected {
            status: 400,
            body: "invalid_grant".into()
        }
        .is_credential_failure());
    }

    #[tokio::test]
    async fn static_token() {
        let source = StaticToken("abc".to_string());
        assert_eq!(source.access_token().await.unwrap(), "abc");
    }
}
