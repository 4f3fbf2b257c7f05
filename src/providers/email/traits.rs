//! Remote mailbox API surface.
//!
//! [`GmailApi`] has one method per remote endpoint and returns raw
//! [`ApiError`]s. The [`Connector`](super::Connector) layers retry and error
//! classification on top and speaks [`ProviderError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::HistoryId;

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// A failed remote call, parsed once from the HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Missing, expired or rejected credentials (HTTP 401 or token refresh failure).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success HTTP response.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Machine-readable reason from the error body, when present.
        reason: Option<String>,
        /// Human-readable message from the error body.
        message: String,
    },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Shorthand for an HTTP error without a reason.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ApiError::Http {
            status,
            reason: None,
            message: message.into(),
        }
    }

    /// Parses a Google API error body (`{"error": {"code", "message", "errors": [{"reason"}]}}`).
    /// Bodies that do not follow that shape are kept verbatim as the message.
    pub fn from_response(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: ErrorBody,
        }
        #[derive(Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            message: String,
            #[serde(default)]
            errors: Vec<ErrorItem>,
            #[serde(default)]
            status: Option<String>,
        }
        #[derive(Deserialize)]
        struct ErrorItem {
            reason: Option<String>,
        }

        if status == 401 {
            return ApiError::Unauthorized(body.to_string());
        }

        match serde_json::from_str::<Envelope>(body) {
            Ok(envelope) => ApiError::Http {
                status,
                reason: envelope
                    .error
                    .errors
                    .into_iter()
                    .find_map(|e| e.reason)
                    .or(envelope.error.status),
                message: envelope.error.message,
            },
            Err(_) => ApiError::http(status, body),
        }
    }

    /// HTTP status, when the error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Unauthorized(_) => Some(401),
            _ => None,
        }
    }
}

/// Errors surfaced by the [`Connector`](super::Connector).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No usable credentials. The account has been marked unauthorized.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// A transient failure persisted through every retry.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    ServiceCallFailed {
        /// Name of the remote operation.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// The last error observed.
        last: ApiError,
    },

    /// A referenced label does not exist remotely.
    #[error("label not found: {0}")]
    LabelNotFound(String),

    /// The remote refused a label change (adding `SENT`).
    #[error("illegal label: {0}")]
    IllegalLabel(String),

    /// The mailbox has no mail service.
    #[error("mail service not enabled")]
    MailNotEnabled,

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other HTTP error.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Undecodable response.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether retrying the enclosing task cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProviderError::InvalidCredentials(_) | ProviderError::MailNotEnabled
        )
    }
}

/// A header of a message part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHeader {
    pub name: String,
    pub value: String,
}

/// Body of a message part: inline data or a reference to attachment bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBody {
    /// Id for fetching the bytes separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    /// Size of the decoded bytes.
    #[serde(default)]
    pub size: u64,
    /// URL-safe base64 of the bytes, when small enough to be inlined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One node of a message's MIME tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePart {
    #[serde(default)]
    pub part_id: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<RemoteHeader>,
    #[serde(default)]
    pub body: RemoteBody,
    #[serde(default)]
    pub parts: Vec<RemotePart>,
}

impl RemotePart {
    /// Value of the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// A full message (`format=full`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<RemotePart>,
}

/// Labels and thread of a message (`format=minimal`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

/// A remote label descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLabel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Id reference to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// One page of the message id listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListPage {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// A message added to or deleted from the mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub message: MessageRef,
}

/// Labels added to or removed from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryLabelChange {
    pub message: MessageRef,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

/// One entry of the change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub messages_added: Vec<HistoryMessage>,
    #[serde(default)]
    pub messages_deleted: Vec<HistoryMessage>,
    #[serde(default)]
    pub labels_added: Vec<HistoryLabelChange>,
    #[serde(default)]
    pub labels_removed: Vec<HistoryLabelChange>,
}

/// One page of the change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    /// Mailbox history id at the time of the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

/// The mailbox profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email_address: String,
    pub history_id: String,
}

/// A remote draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDraft {
    pub id: String,
    pub message: MessageRef,
}

/// One method per remote mailbox endpoint, for a single account.
///
/// Implementations do not retry; the connector does.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GmailApi: Send + Sync {
    /// `users.getProfile`.
    async fn get_profile(&self) -> std::result::Result<Profile, ApiError>;

    /// `users.messages.list` with a search query.
    async fn list_messages(
        &self,
        query: String,
        page_token: Option<String>,
    ) -> std::result::Result<MessageListPage, ApiError>;

    /// `users.history.list` from `start`.
    async fn list_history(
        &self,
        start: HistoryId,
        page_token: Option<String>,
    ) -> std::result::Result<HistoryPage, ApiError>;

    /// `users.messages.get` with `format=full`.
    async fn get_message(&self, id: String) -> std::result::Result<RemoteMessage, ApiError>;

    /// `users.messages.get` with `format=minimal`.
    async fn get_short_message(&self, id: String) -> std::result::Result<ShortMessage, ApiError>;

    /// `users.messages.attachments.get`, returning decoded bytes.
    async fn get_attachment(
        &self,
        message_id: String,
        attachment_id: String,
    ) -> std::result::Result<Vec<u8>, ApiError>;

    /// `users.labels.list`.
    async fn list_labels(&self) -> std::result::Result<Vec<RemoteLabel>, ApiError>;

    /// `users.labels.get`.
    async fn get_label(&self, id: String) -> std::result::Result<RemoteLabel, ApiError>;

    /// `users.messages.modify`.
    async fn modify_labels(
        &self,
        id: String,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> std::result::Result<ShortMessage, ApiError>;

    /// `users.messages.trash`.
    async fn trash(&self, id: String) -> std::result::Result<ShortMessage, ApiError>;

    /// `users.messages.delete`.
    async fn delete(&self, id: String) -> std::result::Result<(), ApiError>;

    /// `users.messages.send` with an RFC 5322 message.
    async fn send(
        &self,
        raw: Vec<u8>,
        thread_id: Option<String>,
    ) -> std::result::Result<ShortMessage, ApiError>;

    /// `users.drafts.create`.
    async fn create_draft(
        &self,
        raw: Vec<u8>,
        thread_id: Option<String>,
    ) -> std::result::Result<RemoteDraft, ApiError>;

    /// `users.drafts.update`.
    async fn update_draft(
        &self,
        draft_id: String,
        raw: Vec<u8>,
        thread_id: Option<String>,
    ) -> std::result::Result<RemoteDraft, ApiError>;

    /// `users.drafts.delete`.
    async fn delete_draft(&self, draft_id: String) -> std::result::Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_google_error_body() {
        let body = r#"{"error":{"code":429,"message":"Rate Limit Exceeded","errors":[{"reason":"rateLimitExceeded"}]}}"#;
        assert_eq!(
            ApiError::from_response(429, body),
            ApiError::Http {
                status: 429,
                reason: Some("rateLimitExceeded".to_string()),
                message: "Rate Limit Exceeded".to_string(),
            }
        );
    }

    #[test]
    fn unparseable_body_is_kept() {
        assert_eq!(
            ApiError::from_response(503, "upstream down"),
            ApiError::http(503, "upstream down")
        );
    }

    #[test]
    fn status_401_is_unauthorized() {
        assert!(matches!(
            ApiError::from_response(401, "{}"),
            ApiError::Unauthorized(_)
        ));
        assert_eq!(ApiError::Transport("x".into()).status(), None);
    }

    #[test]
    fn deserializes_full_message() {
        let json = r#"{
            "id": "18c1",
            "threadId": "18c0",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Hello",
            "payload": {
                "partId": "",
                "mimeType": "multipart/alternative",
                "headers": [{"name": "Subject", "value": "Hi"}],
                "body": {"size": 0},
                "parts": [
                    {"partId": "0", "mimeType": "text/plain", "body": {"size": 5, "data": "SGVsbG8"}}
                ]
            }
        }"#;

        let message: RemoteMessage = serde_json::from_str(json).unwrap();
        let payload = message.payload.unwrap();
        assert_eq!(payload.header("subject"), Some("Hi"));
        assert_eq!(payload.parts[0].body.data.as_deref(), Some("SGVsbG8"));
        assert_eq!(payload.parts[0].filename, "");
    }

    #[test]
    fn deserializes_history_page() {
        let json = r#"{
            "history": [
                {"id": "101", "messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]},
                {"id": "102", "labelsRemoved": [{"message": {"id": "m2"}, "labelIds": ["INBOX"]}]}
            ],
            "historyId": "105"
        }"#;

        let page: HistoryPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.history.len(), 2);
        assert_eq!(page.history[1].labels_removed[0].label_ids, vec!["INBOX"]);
        assert_eq!(page.next_page_token, None);
    }

    #[test]
    fn permanent_errors() {
        assert!(ProviderError::MailNotEnabled.is_permanent());
        assert!(ProviderError::InvalidCredentials("x".into()).is_permanent());
        assert!(!ProviderError::NotFound("x".into()).is_permanent());
    }
}
