//! Outbound draft domain types.
//!
//! An [`OutboundDraft`] is an application-authored message that has not been
//! handed to the remote yet. It is consumed by a successful send or remote
//! draft operation and left intact on failure so it can be retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{AccountId, AttachmentId, DraftId, EmailId, Recipient};

/// How the draft relates to existing mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftKind {
    /// A new message.
    Compose,
    /// Reply to the sender of the original.
    Reply,
    /// Reply to everyone on the original.
    ReplyAll,
    /// Forward the original.
    Forward,
    /// Forward the original together with extra attachments.
    ForwardMulti,
}

impl DraftKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftKind::Compose => "compose",
            DraftKind::Reply => "reply",
            DraftKind::ReplyAll => "reply_all",
            DraftKind::Forward => "forward",
            DraftKind::ForwardMulti => "forward_multi",
        }
    }

    /// Parses the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "compose" => Some(DraftKind::Compose),
            "reply" => Some(DraftKind::Reply),
            "reply_all" => Some(DraftKind::ReplyAll),
            "forward" => Some(DraftKind::Forward),
            "forward_multi" => Some(DraftKind::ForwardMulti),
            _ => None,
        }
    }

    /// Whether this kind continues an existing thread.
    pub fn requires_original(&self) -> bool {
        !matches!(self, DraftKind::Compose)
    }
}

/// An attachment copied from a template into the draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAttachment {
    /// Filename to send.
    pub filename: String,
    /// MIME content type.
    pub mime_type: String,
    /// Key of the bytes in the blob store.
    pub blob_key: String,
}

/// A message waiting to be sent or saved as a remote draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundDraft {
    /// Local identifier.
    pub id: DraftId,
    /// Account to send from.
    pub account_id: AccountId,
    /// Compose, reply, or forward.
    pub kind: DraftKind,
    /// Remote id of the message being replied to or forwarded.
    pub original_message_id: Option<EmailId>,
    /// Remote draft id when this updates an existing remote draft.
    pub remote_draft_id: Option<String>,
    /// Primary recipients.
    pub to: Vec<Recipient>,
    /// Carbon copy recipients.
    pub cc: Vec<Recipient>,
    /// Blind carbon copy recipients.
    pub bcc: Vec<Recipient>,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub body_html: String,
    /// Plain text body.
    pub body_text: String,
    /// Attachments carried over from a template.
    pub template_attachments: Vec<TemplateAttachment>,
    /// Attachments carried over from the original message.
    pub original_attachment_ids: Vec<AttachmentId>,
    /// When the draft was created.
    pub created_at: DateTime<Utc>,
}

/// Structural problems with a draft.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DraftValidationError {
    #[error("a new message cannot reference an original message")]
    UnexpectedOriginal,

    #[error("{0:?} requires exactly one original message")]
    MissingOriginal(DraftKind),

    #[error("original attachments require an original message")]
    OrphanAttachments,

    #[error("draft has no recipients")]
    NoRecipients,
}

impl OutboundDraft {
    /// Creates an empty draft of the given kind.
    pub fn new(account_id: AccountId, kind: DraftKind, original: Option<EmailId>) -> Self {
        Self {
            id: DraftId::from(uuid::Uuid::new_v4().to_string()),
            account_id,
            kind,
            original_message_id: original,
            remote_draft_id: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            body_html: String::new(),
            body_text: String::new(),
            template_attachments: Vec::new(),
            original_attachment_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Checks the compose-vs-original invariant.
    pub fn validate(&self) -> Result<(), DraftValidationError> {
        match (self.kind.requires_original(), &self.original_message_id) {
            (false, Some(_)) => return Err(DraftValidationError::UnexpectedOriginal),
            (true, None) => return Err(DraftValidationError::MissingOriginal(self.kind)),
            _ => {}
        }
        if self.original_message_id.is_none() && !self.original_attachment_ids.is_empty() {
            return Err(DraftValidationError::OrphanAttachments);
        }
        Ok(())
    }

    /// Checks everything [`validate`](Self::validate) does, plus recipients.
    pub fn validate_for_send(&self) -> Result<(), DraftValidationError> {
        self.validate()?;
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(DraftValidationError::NoRecipients);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: DraftKind, original: Option<&str>) -> OutboundDraft {
        let mut d = OutboundDraft::new(AccountId::from("acc"), kind, original.map(EmailId::from));
        d.to.push(Recipient::new("to@example.com"));
        d
    }

    #[test]
    fn compose_without_original_is_valid() {
        assert!(draft(DraftKind::Compose, None).validate_for_send().is_ok());
    }

    #[test]
    fn compose_with_original_is_rejected() {
        assert_eq!(
            draft(DraftKind::Compose, Some("m1")).validate(),
            Err(DraftValidationError::UnexpectedOriginal)
        );
    }

    #[test]
    fn reply_requires_original() {
        assert_eq!(
            draft(DraftKind::Reply, None).validate(),
            Err(DraftValidationError::MissingOriginal(DraftKind::Reply))
        );
        assert!(draft(DraftKind::ReplyAll, Some("m1")).validate().is_ok());
        assert!(draft(DraftKind::ForwardMulti, Some("m1")).validate().is_ok());
    }

    #[test]
    fn send_requires_recipients() {
        let mut d = draft(DraftKind::Compose, None);
        d.to.clear();
        assert!(d.validate().is_ok());
        assert_eq!(d.validate_for_send(), Err(DraftValidationError::NoRecipients));
    }

    #[test]
    fn kind_storage_roundtrip() {
        for kind in [
            DraftKind::Compose,
            DraftKind::Reply,
            DraftKind::ReplyAll,
            DraftKind::Forward,
            DraftKind::ForwardMulti,
        ] {
            assert_eq!(DraftKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(DraftKind::parse("bogus"), None);
    }
}
