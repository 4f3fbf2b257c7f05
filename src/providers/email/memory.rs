//! In-memory mailbox implementing [`GmailApi`].
//!
//! Behaves like a single remote mailbox: every mutation bumps the history id
//! and appends a change record, listings and history are paged, unknown ids
//! answer 404, and adding `SENT` or an unknown label answers 400 with the same
//! messages the real service uses. Failures can be injected per method with
//! [`InMemoryMailbox::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::gmail::encode_base64url;
use super::traits::{
    ApiError, GmailApi, HistoryLabelChange, HistoryMessage, HistoryPage, HistoryRecord,
    MessageListPage, MessageRef, Profile, RemoteBody, RemoteDraft, RemoteHeader, RemoteLabel,
    RemoteMessage, RemotePart, ShortMessage,
};
use crate::domain::HistoryId;

const SYSTEM_LABELS: &[&str] = &[
    "INBOX",
    "SENT",
    "DRAFT",
    "TRASH",
    "SPAM",
    "STARRED",
    "UNREAD",
    "IMPORTANT",
];

/// Builds a full remote message from an RFC 5322 document.
///
/// Parts carrying a filename are exposed by attachment id only, the way the
/// remote does for real attachments; their bytes are returned alongside.
pub fn remote_message_from_raw(
    id: &str,
    thread_id: &str,
    label_ids: &[&str],
    raw: &[u8],
) -> Result<(RemoteMessage, Vec<(String, Vec<u8>)>), mailparse::MailParseError> {
    let parsed = mailparse::parse_mail(raw)?;
    let mut attachments = Vec::new();
    let payload = convert_part(&parsed, String::new(), &mut attachments)?;
    let snippet = parsed
        .get_body()
        .unwrap_or_default()
        .chars()
        .take(100)
        .collect();

    Ok((
        RemoteMessage {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            label_ids: label_ids.iter().map(|l| l.to_string()).collect(),
            snippet,
            history_id: None,
            payload: Some(payload),
        },
        attachments,
    ))
}

fn convert_part(
    mail: &mailparse::ParsedMail<'_>,
    part_id: String,
    attachments: &mut Vec<(String, Vec<u8>)>,
) -> Result<RemotePart, mailparse::MailParseError> {
    let headers = mail
        .headers
        .iter()
        .map(|h| RemoteHeader {
            name: h.get_key(),
            value: h.get_value(),
        })
        .collect();

    let disposition = mail.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| mail.ctype.params.get("name"))
        .cloned()
        .unwrap_or_default();

    let mut part = RemotePart {
        part_id: part_id.clone(),
        mime_type: mail.ctype.mimetype.clone(),
        filename,
        headers,
        body: RemoteBody::default(),
        parts: Vec::new(),
    };

    if mail.subparts.is_empty() {
        let bytes = mail.get_body_raw()?;
        part.body.size = bytes.len() as u64;
        if part.filename.is_empty() {
            part.body.data = Some(encode_base64url(&bytes));
        } else {
            let suffix = if part_id.is_empty() { "0" } else { part_id.as_str() };
            let attachment_id = format!("att-{suffix}");
            part.body.attachment_id = Some(attachment_id.clone());
            attachments.push((attachment_id, bytes));
        }
    } else {
        for (index, sub) in mail.subparts.iter().enumerate() {
            let child_id = if part_id.is_empty() {
                index.to_string()
            } else {
                format!("{part_id}.{index}")
            };
            part.parts.push(convert_part(sub, child_id, attachments)?);
        }
    }

    Ok(part)
}

fn not_found() -> ApiError {
    ApiError::http(404, "Requested entity was not found.")
}

#[derive(Debug, Default)]
struct MailboxState {
    email: String,
    history_id: u64,
    order: Vec<String>,
    messages: HashMap<String, RemoteMessage>,
    labels: BTreeMap<String, RemoteLabel>,
    history: Vec<HistoryRecord>,
    attachments: HashMap<(String, String), Vec<u8>>,
    drafts: HashMap<String, String>,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
    sent: Vec<Vec<u8>>,
    next_id: u64,
}

impl MailboxState {
    fn take_failure(&mut self, method: &'static str) -> Result<(), ApiError> {
        match self.failures.get_mut(method).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn record(&mut self, fill: impl FnOnce(&mut HistoryRecord)) {
        self.history_id += 1;
        let mut record = HistoryRecord {
            id: self.history_id.to_string(),
            ..Default::default()
        };
        fill(&mut record);
        self.history.push(record);
    }

    fn message_ref(message: &RemoteMessage) -> MessageRef {
        MessageRef {
            id: message.id.clone(),
            thread_id: Some(message.thread_id.clone()),
        }
    }

    fn insert(&mut self, message: RemoteMessage, attachments: Vec<(String, Vec<u8>)>) {
        for (attachment_id, bytes) in attachments {
            self.attachments
                .insert((message.id.clone(), attachment_id), bytes);
        }
        if !self.messages.contains_key(&message.id) {
            self.order.push(message.id.clone());
        }
        self.messages.insert(message.id.clone(), message);
    }

    fn add(&mut self, message: RemoteMessage, attachments: Vec<(String, Vec<u8>)>) {
        let reference = Self::message_ref(&message);
        self.insert(message, attachments);
        self.record(|r| r.messages_added.push(HistoryMessage { message: reference }));
    }

    fn remove(&mut self, id: &str) -> Option<RemoteMessage> {
        let message = self.messages.remove(id)?;
        self.order.retain(|m| m != id);
        self.attachments.retain(|(owner, _), _| owner != id);
        let reference = Self::message_ref(&message);
        self.record(|r| r.messages_deleted.push(HistoryMessage { message: reference }));
        Some(message)
    }

    fn modify(&mut self, id: &str, add: &[String], remove: &[String]) -> Result<ShortMessage, ApiError> {
        if !self.messages.contains_key(id) {
            return Err(not_found());
        }
        for label in add {
            if label == "SENT" {
                return Err(ApiError::http(400, "Invalid label: SENT"));
            }
            if !self.labels.contains_key(label) {
                return Err(ApiError::http(400, format!("Label not found: {label}")));
            }
        }

        let Some(message) = self.messages.get_mut(id) else {
            return Err(not_found());
        };
        let mut added = Vec::new();
        for label in add {
            if !message.label_ids.contains(label) {
                message.label_ids.push(label.clone());
                added.push(label.clone());
            }
        }
        let mut removed = Vec::new();
        message.label_ids.retain(|l| {
            let drop = remove.contains(l);
            if drop {
                removed.push(l.clone());
            }
            !drop
        });

        let short = ShortMessage {
            id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            label_ids: message.label_ids.clone(),
        };
        let reference = Self::message_ref(message);

        if !added.is_empty() || !removed.is_empty() {
            self.record(|r| {
                if !added.is_empty() {
                    r.labels_added.push(HistoryLabelChange {
                        message: reference.clone(),
                        label_ids: added,
                    });
                }
                if !removed.is_empty() {
                    r.labels_removed.push(HistoryLabelChange {
                        message: reference,
                        label_ids: removed,
                    });
                }
            });
        }
        Ok(short)
    }

    fn compose(
        &mut self,
        id: String,
        thread_id: Option<String>,
        label: &str,
        raw: &[u8],
    ) -> Result<RemoteMessage, ApiError> {
        let thread_id = match thread_id {
            Some(thread) => thread,
            None => self.next_id("thread"),
        };
        let (message, attachments) = remote_message_from_raw(&id, &thread_id, &[label], raw)
            .map_err(|e| ApiError::http(400, format!("Invalid raw message: {e}")))?;
        self.add(message.clone(), attachments);
        Ok(message)
    }
}

/// A remote mailbox held in memory.
#[derive(Debug)]
pub struct InMemoryMailbox {
    state: Mutex<MailboxState>,
    page_size: usize,
}

impl InMemoryMailbox {
    /// Creates an empty mailbox with the system labels and history id 1000.
    pub fn new(email: impl Into<String>) -> Self {
        let mut state = MailboxState {
            email: email.into(),
            history_id: 1000,
            ..Default::default()
        };
        for id in SYSTEM_LABELS {
            state.labels.insert(
                id.to_string(),
                RemoteLabel {
                    id: id.to_string(),
                    name: id.to_string(),
                    kind: Some("system".to_string()),
                },
            );
        }
        Self {
            state: Mutex::new(state),
            page_size: 100,
        }
    }

    /// Sets the page size of listings and history.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates or renames a user label.
    pub fn add_label(&self, id: &str, name: &str) {
        self.state().labels.insert(
            id.to_string(),
            RemoteLabel {
                id: id.to_string(),
                name: name.to_string(),
                kind: Some("user".to_string()),
            },
        );
    }

    /// Stores a message as already present, without a change record.
    pub fn insert_message(&self, message: RemoteMessage) {
        self.state().insert(message, Vec::new());
    }

    /// Stores a message parsed from RFC 5322 text, without a change record.
    pub fn insert_raw(
        &self,
        id: &str,
        thread_id: &str,
        label_ids: &[&str],
        raw: &[u8],
    ) -> Result<(), mailparse::MailParseError> {
        let (message, attachments) = remote_message_from_raw(id, thread_id, label_ids, raw)?;
        self.state().insert(message, attachments);
        Ok(())
    }

    /// Delivers a new message parsed from RFC 5322 text, recording the addition.
    pub fn deliver_raw(
        &self,
        id: &str,
        thread_id: &str,
        label_ids: &[&str],
        raw: &[u8],
    ) -> Result<(), mailparse::MailParseError> {
        let (message, attachments) = remote_message_from_raw(id, thread_id, label_ids, raw)?;
        self.state().add(message, attachments);
        Ok(())
    }

    /// Stores a chat item: listed and fetchable, but with no date or sender.
    pub fn insert_chat(&self, id: &str) {
        self.insert_message(RemoteMessage {
            id: id.to_string(),
            thread_id: id.to_string(),
            label_ids: vec!["CHAT".to_string()],
            snippet: "chat".to_string(),
            history_id: None,
            payload: Some(RemotePart {
                mime_type: "text/plain".to_string(),
                body: RemoteBody {
                    attachment_id: None,
                    size: 2,
                    data: Some(encode_base64url(b"hi")),
                },
                ..Default::default()
            }),
        });
    }

    /// Stores attachment bytes retrievable by id.
    pub fn set_attachment(&self, message_id: &str, attachment_id: &str, bytes: &[u8]) {
        self.state().attachments.insert(
            (message_id.to_string(), attachment_id.to_string()),
            bytes.to_vec(),
        );
    }

    /// Changes labels as another client would, recording the change.
    pub fn relabel(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<(), ApiError> {
        let add: Vec<String> = add.iter().map(|s| s.to_string()).collect();
        let remove: Vec<String> = remove.iter().map(|s| s.to_string()).collect();
        self.state().modify(id, &add, &remove).map(|_| ())
    }

    /// Deletes a message as another client would, recording the deletion.
    pub fn expunge(&self, id: &str) -> bool {
        self.state().remove(id).is_some()
    }

    /// Makes the next call of `method` fail with `err`.
    pub fn fail_next(&self, method: &'static str, err: ApiError) {
        self.state()
            .failures
            .entry(method)
            .or_default()
            .push_back(err);
    }

    /// Current mailbox history id.
    pub fn history_id(&self) -> HistoryId {
        HistoryId(self.state().history_id)
    }

    /// Label ids currently on a message.
    pub fn label_ids(&self, id: &str) -> Option<Vec<String>> {
        self.state().messages.get(id).map(|m| m.label_ids.clone())
    }

    /// A stored message.
    pub fn message(&self, id: &str) -> Option<RemoteMessage> {
        self.state().messages.get(id).cloned()
    }

    /// Ids of every stored message, in insertion order.
    pub fn message_ids(&self) -> Vec<String> {
        self.state().order.clone()
    }

    /// Raw documents handed to `send`, oldest first.
    pub fn sent_raw(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }

    /// Message id behind a remote draft.
    pub fn draft_message_id(&self, draft_id: &str) -> Option<String> {
        self.state().drafts.get(draft_id).cloned()
    }
}

fn page<T: Clone>(items: &[T], token: Option<&str>, size: usize) -> (Vec<T>, Option<String>) {
    let start = token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(0);
    let end = (start + size).min(items.len());
    let slice = items.get(start..end).unwrap_or_default().to_vec();
    let next = (end < items.len()).then(|| end.to_string());
    (slice, next)
}

#[async_trait]
impl GmailApi for InMemoryMailbox {
    async fn get_profile(&self) -> Result<Profile, ApiError> {
        let mut state = self.state();
        state.take_failure("get_profile")?;
        Ok(Profile {
            email_address: state.email.clone(),
            history_id: state.history_id.to_string(),
        })
    }

    async fn list_messages(
        &self,
        _query: String,
        page_token: Option<String>,
    ) -> Result<MessageListPage, ApiError> {
        let mut state = self.state();
        state.take_failure("list_messages")?;
        let refs: Vec<MessageRef> = state
            .order
            .iter()
            .filter_map(|id| state.messages.get(id))
            .map(MailboxState::message_ref)
            .collect();
        let (messages, next_page_token) = page(&refs, page_token.as_deref(), self.page_size);
        Ok(MessageListPage {
            messages,
            next_page_token,
        })
    }

    async fn list_history(
        &self,
        start: HistoryId,
        page_token: Option<String>,
    ) -> Result<HistoryPage, ApiError> {
        let mut state = self.state();
        state.take_failure("list_history")?;
        let records: Vec<HistoryRecord> = state
            .history
            .iter()
            .filter(|r| HistoryId::parse(&r.id).is_some_and(|id| id > start))
            .cloned()
            .collect();
        let (history, next_page_token) = page(&records, page_token.as_deref(), self.page_size);
        Ok(HistoryPage {
            history,
            next_page_token,
            history_id: Some(state.history_id.to_string()),
        })
    }

    async fn get_message(&self, id: String) -> Result<RemoteMessage, ApiError> {
        let mut state = self.state();
        state.take_failure("get_message")?;
        let mut message = state.messages.get(&id).cloned().ok_or_else(not_found)?;
        message.history_id = Some(state.history_id.to_string());
        Ok(message)
    }

    async fn get_short_message(&self, id: String) -> Result<ShortMessage, ApiError> {
        let mut state = self.state();
        state.take_failure("get_short_message")?;
        let message = state.messages.get(&id).ok_or_else(not_found)?;
        Ok(ShortMessage {
            id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            label_ids: message.label_ids.clone(),
        })
    }

    async fn get_attachment(
        &self,
        message_id: String,
        attachment_id: String,
    ) -> Result<Vec<u8>, ApiError> {
        let mut state = self.state();
        state.take_failure("get_attachment")?;
        state
            .attachments
            .get(&(message_id, attachment_id))
            .cloned()
            .ok_or_else(not_found)
    }

    async fn list_labels(&self) -> Result<Vec<RemoteLabel>, ApiError> {
        let mut state = self.state();
        state.take_failure("list_labels")?;
        Ok(state.labels.values().cloned().collect())
    }

    async fn get_label(&self, id: String) -> Result<RemoteLabel, ApiError> {
        let mut state = self.state();
        state.take_failure("get_label")?;
        state.labels.get(&id).cloned().ok_or_else(not_found)
    }

    async fn modify_labels(
        &self,
        id: String,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<ShortMessage, ApiError> {
        let mut state = self.state();
        state.take_failure("modify_labels")?;
        state.modify(&id, &add, &remove)
    }

    async fn trash(&self, id: String) -> Result<ShortMessage, ApiError> {
        let mut state = self.state();
        state.take_failure("trash")?;
        state.modify(&id, &["TRASH".to_string()], &[])
    }

    async fn delete(&self, id: String) -> Result<(), ApiError> {
        let mut state = self.state();
        state.take_failure("delete")?;
        state.remove(&id).map(|_| ()).ok_or_else(not_found)
    }

    async fn send(&self, raw: Vec<u8>, thread_id: Option<String>) -> Result<ShortMessage, ApiError> {
        let mut state = self.state();
        state.take_failure("send")?;
        let id = state.next_id("sent");
        let message = state.compose(id, thread_id, "SENT", &raw)?;
        state.sent.push(raw);
        Ok(ShortMessage {
            id: message.id,
            thread_id: message.thread_id,
            label_ids: message.label_ids,
        })
    }

    async fn create_draft(
        &self,
        raw: Vec<u8>,
        thread_id: Option<String>,
    ) -> Result<RemoteDraft, ApiError> {
        let mut state = self.state();
        state.take_failure("create_draft")?;
        let draft_id = state.next_id("r");
        let message_id = state.next_id("draft-msg");
        let message = state.compose(message_id, thread_id, "DRAFT", &raw)?;
        state.drafts.insert(draft_id.clone(), message.id.clone());
        Ok(RemoteDraft {
            id: draft_id,
            message: MailboxState::message_ref(&message),
        })
    }

    async fn update_draft(
        &self,
        draft_id: String,
        raw: Vec<u8>,
        thread_id: Option<String>,
    ) -> Result<RemoteDraft, ApiError> {
        let mut state = self.state();
        state.take_failure("update_draft")?;
        let previous = state.drafts.get(&draft_id).cloned().ok_or_else(not_found)?;
        let thread_id = thread_id.or_else(|| state.messages.get(&previous).map(|m| m.thread_id.clone()));
        state.remove(&previous);
        let message_id = state.next_id("draft-msg");
        let message = state.compose(message_id, thread_id, "DRAFT", &raw)?;
        state.drafts.insert(draft_id.clone(), message.id.clone());
        Ok(RemoteDraft {
            id: draft_id,
            message: MailboxState::message_ref(&message),
        })
    }

    async fn delete_draft(&self, draft_id: String) -> Result<(), ApiError> {
        let mut state = self.state();
        state.take_failure("delete_draft")?;
        let message_id = state.drafts.remove(&draft_id).ok_or_else(not_found)?;
        state.remove(&message_id);
        Ok(())
    }
}
