//! Attachment domain types.

use serde::{Deserialize, Serialize};

use super::{AccountId, AttachmentId, EmailId};

/// A stored attachment, owned by exactly one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Local identifier, also used in attachment-serving URLs.
    pub id: AttachmentId,
    /// Account of the owning message.
    pub account_id: AccountId,
    /// Remote id of the owning message.
    pub message_id: EmailId,
    /// Original or synthesized filename.
    pub filename: String,
    /// MIME content type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Whether the HTML body renders this attachment in place.
    pub inline: bool,
    /// `Content-ID` without angle brackets, for inline attachments.
    pub content_id: Option<String>,
    /// Key of the stored bytes in the blob store.
    pub blob_key: String,
}
