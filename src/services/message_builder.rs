//! Remote payload to local message.
//!
//! [`MessageBuilder::build`] turns one [`RemoteMessage`] into a
//! [`BuiltMessage`]: parsed headers, decoded bodies and attachment bytes.
//! The only side effect is fetching attachment bytes that were not inlined.
//! [`save_built_message`] persists the result, or a no-message marker when the
//! item turned out not to be mail.

use chrono::{DateTime, Utc};

use super::body_decoder::decode_body;
use super::mime::{AttachmentPart, AttachmentSource, MimePart};
use super::{Result, SyncError};
use crate::domain::{
    system_labels, AccountId, Attachment, AttachmentId, EmailId, Header, LabelId, Message,
    Recipient, ThreadId,
};
use crate::providers::email::{Connector, ProviderError, RemoteMessage};
use crate::storage::queries::{attachments, messages, no_messages};
use crate::storage::{BlobStore, StorageLayer};

/// Headers that are parsed into fields instead of stored verbatim.
const PARSED_HEADERS: &[&str] = &["subject", "date", "from", "to", "cc", "delivered-to"];

/// An attachment with its bytes, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltAttachment {
    pub attachment: Attachment,
    pub bytes: Vec<u8>,
}

/// Normalized form of one remote message.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltMessage {
    pub account_id: AccountId,
    pub id: EmailId,
    pub thread_id: ThreadId,
    /// Remote label ids as reported, `UNREAD` included.
    pub remote_labels: Vec<LabelId>,
    pub subject: String,
    pub snippet: String,
    pub body_html: String,
    pub body_text: String,
    pub sent_date: Option<DateTime<Utc>>,
    pub sender: Option<Recipient>,
    pub to: Vec<Recipient>,
    pub cc: Vec<Recipient>,
    pub delivered_to: Vec<Recipient>,
    pub headers: Vec<Header>,
    pub attachments: Vec<BuiltAttachment>,
    /// Remote draft this message belongs to, if any.
    pub draft_id: Option<String>,
}

impl BuiltMessage {
    /// Whether this is real mail: it has both a date and a sender.
    pub fn is_mail(&self) -> bool {
        self.sent_date.is_some() && self.sender.is_some()
    }

    /// Whether the remote reports the message unread.
    pub fn is_unread(&self) -> bool {
        self.remote_labels.contains(&system_labels::unread())
    }

    /// Splits into a storable message with the given local label links, or
    /// `None` when this is not mail.
    fn into_message(self, labels: Vec<LabelId>) -> Option<(Message, Vec<BuiltAttachment>)> {
        let is_read = !self.is_unread();
        let (Some(sent_date), Some(sender)) = (self.sent_date, self.sender) else {
            return None;
        };
        let message = Message {
            account_id: self.account_id,
            id: self.id,
            thread_id: self.thread_id,
            is_read,
            subject: self.subject,
            snippet: self.snippet,
            body_html: self.body_html,
            body_text: self.body_text,
            sent_date,
            sender,
            to: self.to,
            cc: self.cc,
            delivered_to: self.delivered_to,
            has_attachment: !self.attachments.is_empty(),
            draft_id: self.draft_id,
            labels,
            headers: self.headers,
        };
        Some((message, self.attachments))
    }
}

/// Parses a `Date` header: strict RFC 2822 first, then a lenient parse.
pub(crate) fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value.trim()) {
        return Some(date.with_timezone(&Utc));
    }
    match mailparse::dateparse(value) {
        Ok(timestamp) => DateTime::from_timestamp(timestamp, 0),
        Err(e) => {
            tracing::debug!(value, error = %e, "unparseable Date header");
            None
        }
    }
}

/// Filename for an attachment sent without one.
fn synthesized_filename(part_id: &str, mime_type: &str) -> String {
    let extension = mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("bin");
    let part_id = if part_id.is_empty() { "0" } else { part_id };
    format!("attachment-{part_id}.{extension}")
}

/// Inline when a `Content-ID` is present, unless the part also claims
/// `inline` disposition and the HTML never references it.
fn is_inline(part: &AttachmentPart, html: &str) -> bool {
    match &part.content_id {
        Some(cid) => !part.disposition_inline || html.contains(&format!("cid:{cid}")),
        None => false,
    }
}

/// Builds messages for one account.
pub struct MessageBuilder<'a> {
    connector: &'a Connector,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(connector: &'a Connector) -> Self {
        Self { connector }
    }

    /// Builds a message. Attachment bytes that were not inlined are fetched;
    /// an attachment that vanished remotely is skipped.
    pub async fn build(&self, remote: &RemoteMessage) -> Result<BuiltMessage> {
        let account_id = self.connector.account_id().clone();
        let id = EmailId(remote.id.clone());

        let mut built = BuiltMessage {
            account_id: account_id.clone(),
            id: id.clone(),
            thread_id: ThreadId(remote.thread_id.clone()),
            remote_labels: remote.label_ids.iter().map(|l| LabelId(l.clone())).collect(),
            subject: String::new(),
            snippet: remote.snippet.clone(),
            body_html: String::new(),
            body_text: String::new(),
            sent_date: None,
            sender: None,
            to: Vec::new(),
            cc: Vec::new(),
            delivered_to: Vec::new(),
            headers: Vec::new(),
            attachments: Vec::new(),
            draft_id: None,
        };

        let Some(payload) = &remote.payload else {
            tracing::debug!(account_id = %account_id, message_id = %id, "message has no payload");
            return Ok(built);
        };

        for header in &payload.headers {
            let name = header.name.to_ascii_lowercase();
            let value = header.value.as_str();
            match name.as_str() {
                "subject" => built.subject = value.trim().to_string(),
                "date" => built.sent_date = parse_date(value),
                "from" => built.sender = Recipient::parse_list(value).into_iter().next(),
                "to" => built.to.extend(Recipient::parse_list(value)),
                "cc" => built.cc.extend(Recipient::parse_list(value)),
                "delivered-to" => built.delivered_to.extend(Recipient::parse_list(value)),
                _ => {}
            }
            if !PARSED_HEADERS.contains(&name.as_str()) {
                built.headers.push(Header::new(header.name.clone(), header.value.clone()));
            }
        }

        let leaves = MimePart::from_remote(payload)
            .map(MimePart::into_leaves)
            .unwrap_or_default();

        let mut pending = Vec::new();
        for leaf in leaves {
            match leaf {
                MimePart::HtmlBody(body) => {
                    built
                        .body_html
                        .push_str(&decode_body(&body.bytes, body.charset.as_deref()).text);
                }
                MimePart::TextBody(body) => {
                    built
                        .body_text
                        .push_str(&decode_body(&body.bytes, body.charset.as_deref()).text);
                }
                MimePart::Attachment(part) => pending.push(part),
                MimePart::Multipart(_) => {}
            }
        }

        for part in pending {
            let inline = is_inline(&part, &built.body_html);
            let bytes = match part.source {
                AttachmentSource::Data(bytes) => bytes,
                AttachmentSource::Remote(ref attachment_id) => {
                    match self.connector.get_attachment_bytes(&id, attachment_id).await {
                        Ok(bytes) => bytes,
                        Err(ProviderError::NotFound(_)) => {
                            tracing::warn!(
                                account_id = %account_id,
                                message_id = %id,
                                part_id = %part.part_id,
                                "attachment gone remotely, skipping"
                            );
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            let attachment_id = AttachmentId(uuid::Uuid::new_v4().to_string());
            let filename = part
                .filename
                .clone()
                .unwrap_or_else(|| synthesized_filename(&part.part_id, &part.mime_type));
            built.attachments.push(BuiltAttachment {
                attachment: Attachment {
                    blob_key: BlobStore::key_for(account_id.as_str(), attachment_id.as_str()),
                    id: attachment_id,
                    account_id: account_id.clone(),
                    message_id: id.clone(),
                    filename,
                    mime_type: part.mime_type,
                    size: bytes.len() as u64,
                    inline,
                    content_id: part.content_id,
                },
                bytes,
            });
        }

        Ok(built)
    }
}

/// What [`save_built_message`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The message and its attachments were committed.
    Saved,
    /// The item is not mail; a marker was recorded instead.
    NoMessage,
    /// Another task stored the same message first.
    AlreadyExists,
}

/// Rewrites `cid:` references of inline attachments to serving URLs.
fn rewrite_inline_references(html: &str, attachments: &[Attachment], url_template: &str) -> String {
    let mut html = html.to_string();
    for attachment in attachments.iter().filter(|a| a.inline) {
        if let Some(cid) = &attachment.content_id {
            let url = url_template.replace("{id}", attachment.id.as_str());
            html = html.replace(&format!("cid:{cid}"), &url);
        }
    }
    html
}

/// Persists a built message with `labels` as its local label links.
///
/// Attachment bytes are written first; the message row, the attachment rows
/// and the rewritten HTML body commit in one transaction. On failure the
/// written bytes are removed again.
pub async fn save_built_message(
    storage: &StorageLayer,
    built: BuiltMessage,
    labels: Vec<LabelId>,
    url_template: &str,
) -> Result<SaveOutcome> {
    let account_id = built.account_id.clone();
    let id = built.id.clone();

    let Some((message, built_attachments)) = built.into_message(labels) else {
        tracing::info!(account_id = %account_id, message_id = %id, "not a mail item, recording marker");
        storage
            .db()
            .with_conn(move |conn| no_messages::record(conn, &account_id, &id))
            .await?;
        return Ok(SaveOutcome::NoMessage);
    };

    let mut written = Vec::with_capacity(built_attachments.len());
    for built in &built_attachments {
        if let Err(e) = storage.blobs().put(&built.attachment.blob_key, &built.bytes).await {
            remove_blobs(storage, &written).await;
            return Err(e.into());
        }
        written.push(built.attachment.blob_key.clone());
    }

    let rows: Vec<Attachment> = built_attachments.into_iter().map(|b| b.attachment).collect();
    let url_template = url_template.to_string();
    let result = storage
        .db()
        .transaction(move |tx| {
            messages::insert(tx, &message)?;
            for attachment in &rows {
                attachments::insert(tx, attachment)?;
            }
            let html = rewrite_inline_references(&message.body_html, &rows, &url_template);
            if html != message.body_html {
                messages::set_body_html(tx, &message.account_id, &message.id, &html)?;
            }
            Ok(())
        })
        .await;

    match result {
        Ok(()) => {
            tracing::debug!(
                account_id = %account_id,
                message_id = %id,
                attachments = written.len(),
                "stored message"
            );
            Ok(SaveOutcome::Saved)
        }
        Err(e) => {
            remove_blobs(storage, &written).await;
            if e.is_unique_violation() {
                tracing::debug!(account_id = %account_id, message_id = %id, "message stored concurrently");
                Ok(SaveOutcome::AlreadyExists)
            } else {
                Err(SyncError::Storage(e))
            }
        }
    }
}

pub(crate) async fn remove_blobs(storage: &StorageLayer, keys: &[String]) {
    for key in keys {
        if let Err(e) = storage.blobs().delete(key).await {
            tracing::warn!(blob_key = %key, error = %e, "failed to remove attachment bytes");
        }
    }
}
