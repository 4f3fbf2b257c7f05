//! RFC 5322 assembly of outbound drafts.

use lettre::address::{Address, Envelope};
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::Message as MimeMessage;

use super::{Result, SyncError};
use crate::domain::{Message, OutboundDraft, Recipient, ThreadId};
use crate::storage::queries::{attachments, messages};
use crate::storage::StorageLayer;

/// An outbound draft rendered for the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    /// The full RFC 5322 document.
    pub raw: Vec<u8>,
    /// Thread of the original message, for replies and forwards.
    pub thread_id: Option<ThreadId>,
}

fn address(email: &str) -> Result<Address> {
    email
        .parse()
        .map_err(|e| SyncError::Compose(format!("invalid address {email:?}: {e}")))
}

fn mailbox(recipient: &Recipient) -> Result<Mailbox> {
    Ok(Mailbox::new(recipient.name.clone(), address(&recipient.email)?))
}

fn content_type(mime_type: &str) -> ContentType {
    ContentType::parse(mime_type).unwrap_or(ContentType::TEXT_PLAIN)
}

fn octet_stream(filename: &str, mime_type: &str, bytes: Vec<u8>) -> SinglePart {
    let content_type = if mime_type.is_empty() {
        ContentType::parse("application/octet-stream").unwrap_or(ContentType::TEXT_PLAIN)
    } else {
        content_type(mime_type)
    };
    MimeAttachment::new(filename.to_string()).body(bytes, content_type)
}

/// `References` for a reply: the original's chain followed by its id.
fn references(original: &Message) -> Option<String> {
    let message_id = original.header("Message-ID")?.trim();
    let chain = original.header("References").map(str::trim).unwrap_or_default();
    Some(if chain.is_empty() {
        message_id.to_string()
    } else {
        format!("{chain} {message_id}")
    })
}

/// Renders `draft` as sent by `from`.
///
/// Replies and forwards load the original message to carry its thread and
/// threading headers. Carried-over attachments are read from the blob store.
pub async fn compose(storage: &StorageLayer, from: &str, draft: &OutboundDraft) -> Result<ComposedMessage> {
    draft.validate()?;

    let original = match &draft.original_message_id {
        Some(id) => {
            let account_id = draft.account_id.clone();
            let lookup = id.clone();
            let message = storage
                .db()
                .with_conn(move |conn| messages::get(conn, &account_id, &lookup))
                .await?;
            Some(message.ok_or_else(|| SyncError::MessageNotFound(id.clone()))?)
        }
        None => None,
    };

    let sender = Mailbox::new(None, address(from)?);
    let mut builder = MimeMessage::builder()
        .from(sender.clone())
        .subject(draft.subject.clone())
        .date_now()
        .keep_bcc();
    for recipient in &draft.to {
        builder = builder.to(mailbox(recipient)?);
    }
    for recipient in &draft.cc {
        builder = builder.cc(mailbox(recipient)?);
    }
    for recipient in &draft.bcc {
        builder = builder.bcc(mailbox(recipient)?);
    }
    if draft.to.is_empty() && draft.cc.is_empty() && draft.bcc.is_empty() {
        // drafts may be saved before anyone is addressed
        let envelope = Envelope::new(Some(sender.email.clone()), vec![sender.email.clone()])
            .map_err(|e| SyncError::Compose(e.to_string()))?;
        builder = builder.envelope(envelope);
    }
    if let Some(original) = &original {
        if let Some(message_id) = original.header("Message-ID") {
            builder = builder.in_reply_to(message_id.trim().to_string());
        }
        if let Some(chain) = references(original) {
            builder = builder.references(chain);
        }
    }

    let body = MultiPart::alternative()
        .singlepart(SinglePart::plain(draft.body_text.clone()))
        .singlepart(SinglePart::html(draft.body_html.clone()));

    let mut files = Vec::new();
    for template in &draft.template_attachments {
        let bytes = storage.blobs().get(&template.blob_key).await?;
        files.push(octet_stream(&template.filename, &template.mime_type, bytes));
    }
    if let Some(original) = &original {
        for attachment_id in &draft.original_attachment_ids {
            let lookup = attachment_id.clone();
            let stored = storage
                .db()
                .with_conn(move |conn| attachments::get(conn, &lookup))
                .await?;
            let Some(stored) = stored.filter(|a| a.message_id == original.id) else {
                tracing::warn!(
                    attachment_id = %attachment_id,
                    message_id = %original.id,
                    "attachment is not part of the original message, skipping"
                );
                continue;
            };
            let bytes = storage.blobs().get(&stored.blob_key).await?;
            files.push(octet_stream(&stored.filename, &stored.mime_type, bytes));
        }
    }

    let rendered = if files.is_empty() {
        builder.multipart(body)
    } else {
        let mixed = files
            .into_iter()
            .fold(MultiPart::mixed().multipart(body), |mixed, file| mixed.singlepart(file));
        builder.multipart(mixed)
    };
    let message = rendered.map_err(|e| SyncError::Compose(e.to_string()))?;

    Ok(ComposedMessage {
        raw: message.formatted(),
        thread_id: original.map(|m| m.thread_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AccountId, Attachment, AttachmentId, DraftKind, EmailId, Header, Label, LabelKind,
        LabelId, MailAccount, TemplateAttachment,
    };
    use crate::storage::queries::{accounts, labels, messages::tests::sample_message};

    async fn storage_with_original(dir: &std::path::Path) -> StorageLayer {
        let storage = StorageLayer::in_memory(dir).await.unwrap();
        accounts::insert(storage.db(), &MailAccount::new("acc", "bob@example.com"))
            .await
            .unwrap();
        storage.blobs().put("acc/att-1", b"%PDF-1.4").await.unwrap();
        storage.blobs().put("templates/logo", b"GIF89a").await.unwrap();
        storage
            .db()
            .with_conn(|conn| {
                labels::insert(
                    conn,
                    &Label {
                        account_id: AccountId::from("acc"),
                        id: LabelId::from("INBOX"),
                        name: "INBOX".to_string(),
                        kind: LabelKind::System,
                        unread: 0,
                    },
                )?;
                let mut original = sample_message("m1");
                original.headers.push(Header::new("References", "<root@example.com>"));
                messages::insert(conn, &original)?;
                attachments::insert(
                    conn,
                    &Attachment {
                        id: AttachmentId::from("att-1"),
                        account_id: AccountId::from("acc"),
                        message_id: EmailId::from("m1"),
                        filename: "report.pdf".to_string(),
                        mime_type: "application/pdf".to_string(),
                        size: 8,
                        inline: false,
                        content_id: None,
                        blob_key: "acc/att-1".to_string(),
                    },
                )
            })
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn reply_carries_threading_headers_and_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_original(dir.path()).await;

        let mut draft = OutboundDraft::new(AccountId::from("acc"), DraftKind::Forward, Some(EmailId::from("m1")));
        draft.to.push(Recipient::with_name("erin@example.com", "Erin"));
        draft.bcc.push(Recipient::new("audit@example.com"));
        draft.subject = "Fwd: Quarterly report".to_string();
        draft.body_text = "see below".to_string();
        draft.body_html = "<p>see below</p>".to_string();
        draft.original_attachment_ids.push(AttachmentId::from("att-1"));
        draft.template_attachments.push(TemplateAttachment {
            filename: "logo.gif".to_string(),
            mime_type: "image/gif".to_string(),
            blob_key: "templates/logo".to_string(),
        });

        let composed = compose(&storage, "bob@example.com", &draft).await.unwrap();
        assert_eq!(composed.thread_id, Some(ThreadId::from("t1")));

        let parsed = mailparse::parse_mail(&composed.raw).unwrap();
        let headers = &parsed.headers;
        use mailparse::MailHeaderMap;
        assert_eq!(headers.get_first_value("In-Reply-To").as_deref(), Some("<abc@example.com>"));
        assert_eq!(
            headers.get_first_value("References").as_deref(),
            Some("<root@example.com> <abc@example.com>")
        );
        assert!(headers.get_first_value("Bcc").unwrap().contains("audit@example.com"));
        assert_eq!(parsed.ctype.mimetype, "multipart/mixed");

        let filenames: Vec<String> = parsed
            .subparts
            .iter()
            .filter_map(|p| p.get_content_disposition().params.get("filename").cloned())
            .collect();
        assert_eq!(filenames, vec!["logo.gif".to_string(), "report.pdf".to_string()]);
    }

    #[tokio::test]
    async fn unaddressed_compose_still_renders() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_original(dir.path()).await;
        let mut draft = OutboundDraft::new(AccountId::from("acc"), DraftKind::Compose, None);
        draft.subject = "Notes".to_string();
        draft.body_text = "todo".to_string();

        let composed = compose(&storage, "bob@example.com", &draft).await.unwrap();

        assert_eq!(composed.thread_id, None);
        let parsed = mailparse::parse_mail(&composed.raw).unwrap();
        assert_eq!(parsed.ctype.mimetype, "multipart/alternative");
        use mailparse::MailHeaderMap;
        assert!(parsed.headers.get_first_value("To").is_none());
        assert!(parsed.headers.get_first_value("Date").is_some());
    }

    #[tokio::test]
    async fn missing_original_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_original(dir.path()).await;
        let mut draft = OutboundDraft::new(AccountId::from("acc"), DraftKind::Reply, Some(EmailId::from("nope")));
        draft.to.push(Recipient::new("erin@example.com"));

        let err = compose(&storage, "bob@example.com", &draft).await.unwrap_err();
        assert!(matches!(err, SyncError::MessageNotFound(id) if id.as_str() == "nope"));
    }

    #[tokio::test]
    async fn invalid_addresses_fail_composition() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_original(dir.path()).await;
        let mut draft = OutboundDraft::new(AccountId::from("acc"), DraftKind::Compose, None);
        draft.to.push(Recipient::new("not an address"));

        let err = compose(&storage, "bob@example.com", &draft).await.unwrap_err();
        assert!(matches!(err, SyncError::Compose(_)));
    }
}
