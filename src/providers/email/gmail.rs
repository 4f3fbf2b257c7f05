//! Gmail REST API client.
//!
//! [`HttpGmailApi`] implements [`GmailApi`] over reqwest for a single
//! account. It performs exactly one request per call (plus one token refresh
//! and replay on a 401) and never retries on its own.
//!
//! Endpoints used (Gmail API v1):
//! - `users.getProfile` for the current history id
//! - `users.messages.list` / `get` / `modify` / `trash` / `delete` / `send`
//! - `users.messages.attachments.get`
//! - `users.history.list` for incremental sync
//! - `users.labels.list` / `get`
//! - `users.drafts.create` / `update` / `delete`

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::oauth::{TokenError, TokenSource};
use super::traits::{
    ApiError, GmailApi, HistoryPage, MessageListPage, Profile, RemoteDraft, RemoteLabel,
    RemoteMessage, ShortMessage,
};
use crate::domain::HistoryId;

/// Default API root for the authenticated user.
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Default OAuth token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Decodes Gmail's URL-safe base64, with or without padding.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed: String = data
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect();
    BASE64_URL_SAFE_NO_PAD.decode(trimmed)
}

/// Encodes bytes as unpadded URL-safe base64.
pub fn encode_base64url(bytes: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    #[serde(default)]
    labels: Vec<RemoteLabel>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest {
    add_label_ids: Vec<String>,
    remove_label_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
}

impl RawMessage {
    fn new(raw: &[u8], thread_id: Option<String>) -> Self {
        Self {
            raw: encode_base64url(raw),
            thread_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct DraftRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    message: RawMessage,
}

/// Gmail API client for one account.
pub struct HttpGmailApi {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    tokens: Arc<dyn TokenSource>,
}

impl HttpGmailApi {
    /// Creates a client against `base_url` (normally [`GMAIL_API_BASE`]).
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        page_size: u32,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size,
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn bearer(&self) -> Result<String, ApiError> {
        self.tokens.access_token().await.map_err(token_error)
    }

    /// Sends the request built by `build`, replaying it once with a fresh
    /// token if the first attempt is rejected with 401.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            let token = self.bearer().await?;
            let response = build(&self.client)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status.as_u16() == 401 && !refreshed {
                self.tokens.invalidate().await;
                refreshed = true;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_response(status.as_u16(), &body));
        }
    }

    async fn json<T, F>(&self, build: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        self.send(build)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn empty<F>(&self, build: F) -> Result<(), ApiError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        self.send(build).await.map(|_| ())
    }
}

fn token_error(err: TokenError) -> ApiError {
    if err.is_credential_failure() {
        ApiError::Unauthorized(err.to_string())
    } else {
        ApiError::Transport(err.to_string())
    }
}

#[async_trait]
impl GmailApi for HttpGmailApi {
    async fn get_profile(&self) -> Result<Profile, ApiError> {
        let url = self.url("/profile");
        self.json(|c| c.get(&url)).await
    }

    async fn list_messages(
        &self,
        query: String,
        page_token: Option<String>,
    ) -> Result<MessageListPage, ApiError> {
        let url = self.url("/messages");
        let page_size = self.page_size.to_string();
        self.json(|c| {
            let mut req = c.get(&url).query(&[
                ("q", query.as_str()),
                ("maxResults", page_size.as_str()),
                ("includeSpamTrash", "true"),
            ]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            req
        })
        .await
    }

    async fn list_history(
        &self,
        start: HistoryId,
        page_token: Option<String>,
    ) -> Result<HistoryPage, ApiError> {
        let url = self.url("/history");
        let start = start.to_string();
        let page_size = self.page_size.to_string();
        self.json(|c| {
            let mut req = c.get(&url).query(&[
                ("startHistoryId", start.as_str()),
                ("maxResults", page_size.as_str()),
            ]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            req
        })
        .await
    }

    async fn get_message(&self, id: String) -> Result<RemoteMessage, ApiError> {
        let url = self.url(&format!("/messages/{id}"));
        self.json(|c| c.get(&url).query(&[("format", "full")])).await
    }

    async fn get_short_message(&self, id: String) -> Result<ShortMessage, ApiError> {
        let url = self.url(&format!("/messages/{id}"));
        self.json(|c| c.get(&url).query(&[("format", "minimal")])).await
    }

    async fn get_attachment(
        &self,
        message_id: String,
        attachment_id: String,
    ) -> Result<Vec<u8>, ApiError> {
        let url = self.url(&format!("/messages/{message_id}/attachments/{attachment_id}"));
        let body: AttachmentResponse = self.json(|c| c.get(&url)).await?;
        decode_base64url(&body.data).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn list_labels(&self) -> Result<Vec<RemoteLabel>, ApiError> {
        let url = self.url("/labels");
        let body: LabelsListResponse = self.json(|c| c.get(&url)).await?;
        Ok(body.labels)
    }

    async fn get_label(&self, id: String) -> Result<RemoteLabel, ApiError> {
        let url = self.url(&format!("/labels/{id}"));
        self.json(|c| c.get(&url)).await
    }

    async fn modify_labels(
        &self,
        id: String,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<ShortMessage, ApiError> {
        let url = self.url(&format!("/messages/{id}/modify"));
        let body = ModifyRequest {
            add_label_ids: add,
            remove_label_ids: remove,
        };
        self.json(|c| c.post(&url).json(&body)).await
    }

    async fn trash(&self, id: String) -> Result<ShortMessage, ApiError> {
        let url = self.url(&format!("/messages/{id}/trash"));
        self.json(|c| c.post(&url)).await
    }

    async fn delete(&self, id: String) -> Result<(), ApiError> {
        let url = self.url(&format!("/messages/{id}"));
        self.empty(|c| c.delete(&url)).await
    }

    async fn send(&self, raw: Vec<u8>, thread_id: Option<String>) -> Result<ShortMessage, ApiError> {
        let url = self.url("/messages/send");
        let body = RawMessage::new(&raw, thread_id);
        self.json(|c| c.post(&url).json(&body)).await
    }

    async fn create_draft(
        &self,
        raw: Vec<u8>,
        thread_id: Option<String>,
    ) -> Result<RemoteDraft, ApiError> {
        let url = self.url("/drafts");
        let body = DraftRequest {
            id: None,
            message: RawMessage::new(&raw, thread_id),
        };
        self.json(|c| c.post(&url).json(&body)).await
    }

    async fn update_draft(
        &self,
        draft_id: String,
        raw: Vec<u8>,
        thread_id: Option<String>,
    ) -> Result<RemoteDraft, ApiError> {
        let url = self.url(&format!("/drafts/{draft_id}"));
        let body = DraftRequest {
            id: Some(draft_id.clone()),
            message: RawMessage::new(&raw, thread_id),
        };
        self.json(|c| c.request(Method::PUT, &url).json(&body)).await
    }

    async fn delete_draft(&self, draft_id: String) -> Result<(), ApiError> {
        let url = self.url(&format!("/drafts/{draft_id}"));
        self.empty(|c| c.delete(&url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::email::oauth::StaticToken;

    #[test]
    fn base64url_accepts_padding_and_whitespace() {
        assert_eq!(decode_base64url("SGVsbG8=").unwrap(), b"Hello");
        assert_eq!(decode_base64url("SGVs\nbG8").unwrap(), b"Hello");
        assert_eq!(decode_base64url("_-8").unwrap(), vec![0xff, 0xef]);
        assert!(decode_base64url("***").is_err());
    }

    #[test]
    fn encode_is_unpadded_url_safe() {
        assert_eq!(encode_base64url(&[0xff, 0xef]), "_-8");
    }

    #[test]
    fn draft_request_shape() {
        let body = DraftRequest {
            id: Some("r-1".to_string()),
            message: RawMessage::new(b"Subject: x\r\n\r\nbody", Some("t1".to_string())),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["id"], "r-1");
        assert_eq!(json["message"]["threadId"], "t1");
        assert!(json["message"]["raw"].as_str().unwrap().starts_with("U3ViamVjd"));
    }

    #[test]
    fn base_url_is_normalized() {
        let api = HttpGmailApi::new(
            reqwest::Client::new(),
            "https://example.test/gmail/",
            100,
            Arc::new(StaticToken("t".into())),
        );
        assert_eq!(api.url("/profile"), "https://example.test/gmail/profile");
    }

    #[test]
    fn token_errors_map_to_api_errors() {
        assert!(matches!(
            token_error(TokenError::MissingClientSecret),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            token_error(TokenError::Transport("down".into())),
            ApiError::Transport(_)
        ));
    }
}
