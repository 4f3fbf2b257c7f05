//! Synchronization services.
//!
//! Everything between the connector and the database lives here:
//!
//! ```text
//!   Scheduler --> TaskQueue --> TaskWorker
//!                                   |
//!                                   v
//!                             SyncManager  --> Connector (remote)
//!                               |      |
//!                 MessageBuilder   LabelBuilder
//!                               |      |
//!                               v      v
//!                            StorageLayer (local mirror)
//! ```
//!
//! - [`MessageBuilder`]: remote payload to a normalized message with attachments
//! - [`LabelBuilder`]: get-or-create of local labels
//! - [`SyncManager`]: full and incremental sync, label mutations, send and drafts
//! - [`tasks`]: task enum, queue, worker with retry, scheduler

mod body_decoder;
mod label_builder;
mod message_builder;
mod mime;
mod outbound;
mod sync_service;
pub mod tasks;

use thiserror::Error;

use crate::domain::{AccountId, DraftId, DraftValidationError, EmailId};
use crate::providers::email::ProviderError;
use crate::storage::{BlobError, DatabaseError};

pub use body_decoder::{decode_body, DecodeSource, DecodedBody};
pub use label_builder::LabelBuilder;
pub use message_builder::{
    save_built_message, BuiltAttachment, BuiltMessage, MessageBuilder, SaveOutcome,
};
pub use mime::{AttachmentPart, AttachmentSource, BodyPart, MimePart};
pub use outbound::{compose, ComposedMessage};
pub use sync_service::{
    DownloadOutcome, FullSyncReport, HistorySyncReport, LabelUpdateOutcome, SyncManager,
    SyncOptions,
};
pub use tasks::{
    ApiFactory, LocalTaskQueue, ManagerFactory, QueueError, ScheduleDecision, Scheduler, SkipReason,
    SyncTask, TaskHandler, TaskQueue, TaskReceiver, TaskWorker, WorkerOptions,
};

/// Errors from synchronization and mutation operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("message not found: {0}")]
    MessageNotFound(EmailId),

    #[error("draft not found: {0}")]
    DraftNotFound(DraftId),

    #[error("invalid draft: {0}")]
    InvalidDraft(#[from] DraftValidationError),

    #[error("cannot compose message: {0}")]
    Compose(String),
}

impl SyncError {
    /// Whether running the same task again cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            SyncError::Provider(e) => e.is_permanent(),
            SyncError::AccountNotFound(_)
            | SyncError::DraftNotFound(_)
            | SyncError::InvalidDraft(_)
            | SyncError::Compose(_) => true,
            _ => false,
        }
    }

    /// Whether the remote reported the target as gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Provider(ProviderError::NotFound(_)))
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_follows_the_provider() {
        assert!(SyncError::Provider(ProviderError::MailNotEnabled).is_permanent());
        assert!(!SyncError::Provider(ProviderError::Connection("reset".into())).is_permanent());
        assert!(SyncError::AccountNotFound(AccountId::from("a")).is_permanent());
        assert!(!SyncError::MessageNotFound(EmailId::from("m")).is_permanent());
    }

    #[test]
    fn not_found_is_detected() {
        assert!(SyncError::Provider(ProviderError::NotFound("gone".into())).is_not_found());
        assert!(!SyncError::DraftNotFound(DraftId::from("d")).is_not_found());
    }
}
