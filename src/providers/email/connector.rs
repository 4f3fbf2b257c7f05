//! Retrying, classifying wrapper over [`GmailApi`].
//!
//! Every remote call goes through [`Connector::execute`]:
//!
//! - 403, 429, 500 and 503 are retried with exponential backoff plus jitter,
//!   up to the configured attempt budget, then fail as
//!   [`ProviderError::ServiceCallFailed`]
//! - semantic failures (unknown label, illegal label, mail not enabled, 404)
//!   become typed errors without retry
//! - an authorization failure marks the account unauthorized and not syncing
//!   before the error propagates
//! - anything else is logged and surfaced after a single attempt

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::traits::{
    ApiError, GmailApi, HistoryRecord, ProviderError, RemoteDraft, RemoteLabel, RemoteMessage,
    Result, ShortMessage,
};
use crate::domain::{AccountId, EmailId, HistoryId, LabelId};
use crate::storage::{queries, Database};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Sleep before retry `n` (0-based) is `unit * 2^n + unit * rand[0, 1)`.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retrying after failed attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_unit.saturating_mul(1u32 << attempt.min(16));
        let jitter = self.backoff_unit.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        base + jitter
    }
}

/// Result of paging through the change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryDelta {
    /// Every record from every page, in order.
    pub records: Vec<HistoryRecord>,
    /// Highest history id observed, never below the starting id.
    pub history_id: HistoryId,
}

/// Full listing of message ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListing {
    /// Every listed id, deduplicated, in listing order.
    pub ids: Vec<EmailId>,
    /// Mailbox history id read before listing started.
    pub history_id: HistoryId,
}

enum Failure {
    Retry(ApiError),
    Deauthorize(String),
    Fatal(ProviderError),
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}

fn classify(err: ApiError) -> Failure {
    match err {
        ApiError::Unauthorized(message) => Failure::Deauthorize(message),
        ApiError::Http {
            status,
            reason,
            message,
        } => {
            let text = format!("{} {}", reason.as_deref().unwrap_or_default(), message);
            if contains_ci(&text, "mail service not enabled") {
                return Failure::Fatal(ProviderError::MailNotEnabled);
            }
            match status {
                400 if contains_ci(&text, "label not found") => {
                    Failure::Fatal(ProviderError::LabelNotFound(message))
                }
                400 if contains_ci(&text, "invalid label") && text.contains("SENT") => {
                    Failure::Fatal(ProviderError::IllegalLabel(message))
                }
                404 => Failure::Fatal(ProviderError::NotFound(message)),
                403 | 429 | 500 | 503 => Failure::Retry(ApiError::Http {
                    status,
                    reason,
                    message,
                }),
                _ => Failure::Fatal(ProviderError::Http { status, message }),
            }
        }
        ApiError::Transport(message) => Failure::Fatal(ProviderError::Connection(message)),
        ApiError::Decode(message) => Failure::Fatal(ProviderError::Decode(message)),
    }
}

/// Remote mailbox access for one account.
#[derive(Clone)]
pub struct Connector {
    api: Arc<dyn GmailApi>,
    db: Database,
    account_id: AccountId,
    policy: RetryPolicy,
    excluded_query: String,
}

impl Connector {
    /// Creates a connector for `account_id`.
    pub fn new(api: Arc<dyn GmailApi>, db: Database, account_id: AccountId) -> Self {
        Self {
            api,
            db,
            account_id,
            policy: RetryPolicy::default(),
            excluded_query: "-in:chats".to_string(),
        }
    }

    /// Overrides the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the listing query used to skip chat items.
    pub fn with_excluded_query(mut self, query: impl Into<String>) -> Self {
        self.excluded_query = query.into();
        self
    }

    /// Account this connector acts for.
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Runs `call` under the retry and classification policy.
    pub async fn execute<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match classify(err) {
                Failure::Retry(last) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        tracing::error!(
                            account_id = %self.account_id,
                            operation,
                            attempts = attempt,
                            error = %last,
                            "remote call failed after retries"
                        );
                        return Err(ProviderError::ServiceCallFailed {
                            operation,
                            attempts: attempt,
                            last,
                        });
                    }
                    let delay = self.policy.delay(attempt - 1);
                    tracing::warn!(
                        account_id = %self.account_id,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %last,
                        "transient remote error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Failure::Deauthorize(message) => {
                    tracing::warn!(
                        account_id = %self.account_id,
                        operation,
                        error = %message,
                        "credentials rejected, deauthorizing account"
                    );
                    if let Err(e) = queries::accounts::deauthorize(&self.db, &self.account_id).await {
                        tracing::error!(account_id = %self.account_id, error = %e, "failed to persist deauthorization");
                    }
                    return Err(ProviderError::InvalidCredentials(message));
                }
                Failure::Fatal(err) => {
                    tracing::warn!(account_id = %self.account_id, operation, error = %err, "remote call failed");
                    return Err(err);
                }
            }
        }
    }

    /// Pages through the change stream from `since`.
    pub async fn get_history(&self, since: HistoryId) -> Result<HistoryDelta> {
        let mut delta = HistoryDelta {
            records: Vec::new(),
            history_id: since,
        };
        let mut page_token: Option<String> = None;

        loop {
            let token = page_token.clone();
            let page = self
                .execute("history.list", || self.api.list_history(since, token.clone()))
                .await?;

            if let Some(id) = page.history_id.as_deref().and_then(HistoryId::parse) {
                delta.history_id = delta.history_id.max(id);
            }
            for record in &page.history {
                if let Some(id) = HistoryId::parse(&record.id) {
                    delta.history_id = delta.history_id.max(id);
                }
            }
            delta.records.extend(page.history);

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            account_id = %self.account_id,
            since = %since,
            records = delta.records.len(),
            history_id = %delta.history_id,
            "fetched history"
        );
        Ok(delta)
    }

    /// Current mailbox history id.
    pub async fn current_history_id(&self) -> Result<HistoryId> {
        let profile = self.execute("profile.get", || self.api.get_profile()).await?;
        HistoryId::parse(&profile.history_id)
            .ok_or_else(|| ProviderError::Decode(format!("bad history id {:?}", profile.history_id)))
    }

    /// Lists every message id (excluding chats), with the history id read
    /// before the listing began.
    pub async fn list_all_message_ids(&self) -> Result<MessageListing> {
        let history_id = self.current_history_id().await?;

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = page_token.clone();
            let page = self
                .execute("messages.list", || {
                    self.api.list_messages(self.excluded_query.clone(), token.clone())
                })
                .await?;

            for message in page.messages {
                if seen.insert(message.id.clone()) {
                    ids.push(EmailId(message.id));
                }
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::info!(
            account_id = %self.account_id,
            count = ids.len(),
            history_id = %history_id,
            "listed remote message ids"
        );
        Ok(MessageListing { ids, history_id })
    }

    /// Full message payload.
    pub async fn get_message(&self, id: &EmailId) -> Result<RemoteMessage> {
        self.execute("messages.get", || self.api.get_message(id.0.clone()))
            .await
    }

    /// Labels and thread of a message.
    pub async fn get_short_message(&self, id: &EmailId) -> Result<ShortMessage> {
        self.execute("messages.get.minimal", || {
            self.api.get_short_message(id.0.clone())
        })
        .await
    }

    /// One label descriptor.
    pub async fn get_label(&self, id: &LabelId) -> Result<RemoteLabel> {
        self.execute("labels.get", || self.api.get_label(id.0.clone()))
            .await
    }

    /// Every label descriptor.
    pub async fn list_labels(&self) -> Result<Vec<RemoteLabel>> {
        self.execute("labels.list", || self.api.list_labels()).await
    }

    /// Decoded attachment bytes.
    pub async fn get_attachment_bytes(&self, message_id: &EmailId, attachment_id: &str) -> Result<Vec<u8>> {
        self.execute("attachments.get", || {
            self.api
                .get_attachment(message_id.0.clone(), attachment_id.to_string())
        })
        .await
    }

    /// Adds and removes labels on a message.
    pub async fn update_labels(
        &self,
        id: &EmailId,
        add: &[LabelId],
        remove: &[LabelId],
    ) -> Result<ShortMessage> {
        let add: Vec<String> = add.iter().map(|l| l.0.clone()).collect();
        let remove: Vec<String> = remove.iter().map(|l| l.0.clone()).collect();
        self.execute("messages.modify", || {
            self.api.modify_labels(id.0.clone(), add.clone(), remove.clone())
        })
        .await
    }

    /// Moves a message to the trash.
    pub async fn trash(&self, id: &EmailId) -> Result<ShortMessage> {
        self.execute("messages.trash", || self.api.trash(id.0.clone()))
            .await
    }

    /// Permanently deletes a message.
    pub async fn delete(&self, id: &EmailId) -> Result<()> {
        self.execute("messages.delete", || self.api.delete(id.0.clone()))
            .await
    }

    /// Sends an RFC 5322 message, optionally within a thread.
    pub async fn send(&self, raw: &[u8], thread_id: Option<&str>) -> Result<ShortMessage> {
        let thread_id = thread_id.map(str::to_string);
        self.execute("messages.send", || {
            self.api.send(raw.to_vec(), thread_id.clone())
        })
        .await
    }

    /// Creates a remote draft.
    pub async fn create_draft(&self, raw: &[u8], thread_id: Option<&str>) -> Result<RemoteDraft> {
        let thread_id = thread_id.map(str::to_string);
        self.execute("drafts.create", || {
            self.api.create_draft(raw.to_vec(), thread_id.clone())
        })
        .await
    }

    /// Replaces the content of a remote draft.
    pub async fn update_draft(
        &self,
        draft_id: &str,
        raw: &[u8],
        thread_id: Option<&str>,
    ) -> Result<RemoteDraft> {
        let thread_id = thread_id.map(str::to_string);
        self.execute("drafts.update", || {
            self.api
                .update_draft(draft_id.to_string(), raw.to_vec(), thread_id.clone())
        })
        .await
    }

    /// Deletes a remote draft.
    pub async fn delete_draft(&self, draft_id: &str) -> Result<()> {
        self.execute("drafts.delete", || {
            self.api.delete_draft(draft_id.to_string())
        })
        .await
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("account_id", &self.account_id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
