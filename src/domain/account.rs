//! Mail account domain types.
//!
//! A [`MailAccount`] is one connected mailbox and carries the incremental
//! sync cursor. OAuth tokens live in the system keychain, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, HistoryId};

/// A connected mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAccount {
    /// Unique external account id.
    pub id: AccountId,
    /// Mailbox address, used as the sender of outbound mail.
    pub email: String,
    /// Whether the stored credentials are still usable.
    pub authorized: bool,
    /// Cursor for incremental sync; `None` until the first full sync.
    pub history_id: Option<HistoryId>,
    /// Advisory flag set while a sync run is in flight.
    pub is_syncing: bool,
    /// When the first full synchronization completed.
    pub first_sync_finished_at: Option<DateTime<Utc>>,
    /// Soft-delete marker. Deleted accounts are never synchronized.
    pub deleted: bool,
}

/// Conceptual per-account synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "history_id", rename_all = "snake_case")]
pub enum SyncState {
    /// No cursor yet; a full synchronization is required.
    NeedsFullSync,
    /// A full synchronization has been started and has not finished.
    FullSyncInFlight,
    /// Idle at the given cursor.
    Synced(HistoryId),
    /// A history-based run is in flight from the given cursor.
    IncrementalSyncInFlight(HistoryId),
    /// Credentials failed; no sync until they are renewed.
    Deauthorized,
}

impl MailAccount {
    /// Creates a freshly authorized account with no sync cursor.
    pub fn new(id: impl Into<AccountId>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            authorized: true,
            history_id: None,
            is_syncing: false,
            first_sync_finished_at: None,
            deleted: false,
        }
    }

    /// Derives the sync state from the persisted flags.
    pub fn sync_state(&self) -> SyncState {
        if !self.authorized {
            return SyncState::Deauthorized;
        }
        match (self.history_id, self.is_syncing) {
            (_, true) if self.first_sync_finished_at.is_none() => SyncState::FullSyncInFlight,
            (None, false) => SyncState::NeedsFullSync,
            (None, true) => SyncState::FullSyncInFlight,
            (Some(h), true) => SyncState::IncrementalSyncInFlight(h),
            (Some(h), false) => SyncState::Synced(h),
        }
    }

    /// Whether a scheduler may enqueue new sync work for this account.
    pub fn can_sync(&self) -> bool {
        self.authorized && !self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_needs_full_sync() {
        let account = MailAccount::new("acc-1", "user@example.com");
        assert_eq!(account.sync_state(), SyncState::NeedsFullSync);
        assert!(account.can_sync());
    }

    #[test]
    fn syncing_before_first_finish_is_full_sync() {
        let mut account = MailAccount::new("acc-1", "user@example.com");
        account.is_syncing = true;
        account.history_id = Some(HistoryId(10));
        assert_eq!(account.sync_state(), SyncState::FullSyncInFlight);
    }

    #[test]
    fn synced_and_incremental_states() {
        let mut account = MailAccount::new("acc-1", "user@example.com");
        account.history_id = Some(HistoryId(10));
        account.first_sync_finished_at = Some(Utc::now());
        assert_eq!(account.sync_state(), SyncState::Synced(HistoryId(10)));

        account.is_syncing = true;
        assert_eq!(
            account.sync_state(),
            SyncState::IncrementalSyncInFlight(HistoryId(10))
        );
    }

    #[test]
    fn deauthorized_wins_over_everything() {
        let mut account = MailAccount::new("acc-1", "user@example.com");
        account.history_id = Some(HistoryId(10));
        account.authorized = false;
        assert_eq!(account.sync_state(), SyncState::Deauthorized);
        assert!(!account.can_sync());
    }

    #[test]
    fn sync_state_serialization() {
        let json = serde_json::to_string(&SyncState::Synced(HistoryId(7))).unwrap();
        assert_eq!(json, r#"{"state":"synced","history_id":7}"#);
    }
}
