//! Domain layer types for the mailbox mirror.
//!
//! Plain, serde-serializable records: accounts, mirrored messages, labels,
//! attachments, chat markers and outbound drafts, plus the newtype ids that
//! key them.

mod account;
mod attachment;
mod draft;
mod label;
mod message;
mod types;

pub use account::{MailAccount, SyncState};
pub use attachment::Attachment;
pub use draft::{DraftKind, DraftValidationError, OutboundDraft, TemplateAttachment};
pub use label::{system_labels, Label, LabelKind};
pub use message::{Header, Message, NoMessageMarker, Recipient};
pub use types::{AccountId, AttachmentId, DraftId, EmailId, HistoryId, LabelId, ThreadId};
