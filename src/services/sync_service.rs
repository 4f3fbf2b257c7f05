//! Synchronization manager.
//!
//! A [`SyncManager`] acts for one account for the duration of one task. It
//! reconciles the local mirror against the remote mailbox:
//!
//! - full synchronization lists every remote id and schedules per-message work
//! - incremental synchronization applies the change stream since the stored
//!   history cursor
//! - per-message downloads and label refreshes re-check local state first, so
//!   concurrent workers on the same id converge
//! - label mutations (star, read, spam, archive) and send/draft operations
//!   change the remote first and mirror the result locally
//!
//! Unread counters are recomputed after every operation that can change them.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;

use super::label_builder::LabelBuilder;
use super::message_builder::{remove_blobs, save_built_message, MessageBuilder, SaveOutcome};
use super::outbound::compose;
use super::tasks::{SyncTask, TaskQueue};
use super::{Result, SyncError};
use crate::config::{Settings, DEFAULT_ATTACHMENT_URL_TEMPLATE};
use crate::domain::{
    system_labels, AccountId, DraftId, EmailId, HistoryId, LabelId, MailAccount, OutboundDraft,
    ThreadId,
};
use crate::providers::email::{Connector, ProviderError, ShortMessage};
use crate::storage::queries::{accounts, drafts, labels, messages, no_messages};
use crate::storage::{Database, StorageLayer};

/// Manager tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Attempts of the refetch-and-modify loop in
    /// [`SyncManager::add_and_remove_labels`].
    pub label_update_attempts: u32,
    /// Serving URL for inline attachments; `{id}` is the attachment id.
    pub attachment_url_template: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            label_update_attempts: 6,
            attachment_url_template: DEFAULT_ATTACHMENT_URL_TEMPLATE.to_string(),
        }
    }
}

impl SyncOptions {
    /// Options from the `sync` and `storage` settings sections.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            label_update_attempts: settings.sync.label_update_attempts.max(1),
            attachment_url_template: settings.storage.attachment_url_template().to_string(),
        }
    }
}

/// Result of a full synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    /// Cursor stored once everything was scheduled.
    pub history_id: HistoryId,
    pub listed: usize,
    /// Ids already known not to be mail.
    pub skipped: usize,
    pub refreshes: usize,
    pub downloads: usize,
}

/// Result of an incremental synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistorySyncReport {
    /// The account had no usable cursor; a full synchronization was queued.
    FullSyncScheduled,
    /// The change stream was empty.
    UpToDate,
    Applied {
        previous: HistoryId,
        history_id: HistoryId,
        downloads: usize,
        refreshes: usize,
        deleted: usize,
    },
}

/// Result of downloading or refreshing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// A new message was stored.
    Stored,
    /// The item is not mail; a marker was recorded.
    NotMail,
    /// The id was already marked as not mail.
    Marked,
    /// The message no longer exists remotely.
    Gone,
    /// The stored message's labels or thread were updated.
    LabelsRefreshed,
    /// The stored message already matched the remote.
    Unchanged,
}

impl DownloadOutcome {
    fn changed_mirror(&self) -> bool {
        matches!(self, DownloadOutcome::Stored | DownloadOutcome::LabelsRefreshed)
    }
}

/// Result of [`SyncManager::add_and_remove_labels`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelUpdateOutcome {
    /// The remote accepted this delta and it was mirrored locally.
    Applied {
        added: Vec<LabelId>,
        removed: Vec<LabelId>,
    },
    /// The message already had the requested labels.
    NothingToChange,
    /// The remote does not know one of the labels.
    LabelNotFound,
    /// The message no longer exists remotely.
    Gone,
    /// Every attempt saw the change not take effect.
    Exhausted,
}

/// Labels an archive never removes.
fn kept_on_archive() -> [LabelId; 3] {
    [
        system_labels::unread(),
        system_labels::sent(),
        system_labels::draft(),
    ]
}

/// Synchronization and mutation operations for one account.
pub struct SyncManager {
    storage: StorageLayer,
    connector: Connector,
    queue: Arc<dyn TaskQueue>,
    options: SyncOptions,
}

impl SyncManager {
    pub fn new(
        storage: StorageLayer,
        connector: Connector,
        queue: Arc<dyn TaskQueue>,
        options: SyncOptions,
    ) -> Self {
        Self {
            storage,
            connector,
            queue,
            options,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        self.connector.account_id()
    }

    fn db(&self) -> &Database {
        self.storage.db()
    }

    async fn account(&self) -> Result<MailAccount> {
        accounts::get_by_id(self.db(), self.account_id())
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(self.account_id().clone()))
    }

    fn enqueue(&self, task: SyncTask) -> Result<()> {
        self.queue.enqueue(task)?;
        Ok(())
    }

    async fn recompute_unread(&self) -> Result<()> {
        let account_id = self.account_id().clone();
        let updated = self
            .db()
            .with_conn(move |conn| labels::recompute_unread(conn, &account_id))
            .await?;
        tracing::debug!(account_id = %self.account_id(), labels = updated, "recomputed unread counters");
        Ok(())
    }

    async fn reset_syncing(&self) {
        if let Err(e) = accounts::set_syncing(self.db(), self.account_id(), false).await {
            tracing::error!(account_id = %self.account_id(), error = %e, "failed to clear syncing flag");
        }
    }

    /// Get-or-creates every remote label, refreshing names.
    pub async fn sync_labels(&self) -> Result<usize> {
        let remote = self.connector.list_labels().await?;
        let builder = LabelBuilder::new(self.db(), &self.connector);
        for label in &remote {
            builder.get_or_create(label).await?;
        }
        tracing::info!(account_id = %self.account_id(), count = remote.len(), "synchronized labels");
        Ok(remote.len())
    }

    /// Lists every remote message and schedules its download or label
    /// refresh, then the completion task, then stores the listing cursor.
    ///
    /// The syncing flag stays set until the completion task runs. It is
    /// cleared again if this fails.
    pub async fn full_synchronize(&self) -> Result<FullSyncReport> {
        tracing::info!(account_id = %self.account_id(), "starting full synchronization");
        accounts::set_syncing(self.db(), self.account_id(), true).await?;

        match self.run_full_sync().await {
            Ok(report) => {
                tracing::info!(
                    account_id = %self.account_id(),
                    listed = report.listed,
                    downloads = report.downloads,
                    refreshes = report.refreshes,
                    skipped = report.skipped,
                    history_id = %report.history_id,
                    "full synchronization scheduled"
                );
                Ok(report)
            }
            Err(e) => {
                self.reset_syncing().await;
                Err(e)
            }
        }
    }

    async fn run_full_sync(&self) -> Result<FullSyncReport> {
        self.sync_labels().await?;
        let listing = self.connector.list_all_message_ids().await?;

        let account_id = self.account_id().clone();
        let (markers, existing) = self
            .db()
            .with_conn(move |conn| {
                Ok((
                    no_messages::ids_for_account(conn, &account_id)?,
                    messages::ids_for_account(conn, &account_id)?,
                ))
            })
            .await?;

        let mut report = FullSyncReport {
            history_id: listing.history_id,
            listed: listing.ids.len(),
            ..Default::default()
        };
        for id in listing.ids {
            let account_id = self.account_id().clone();
            if markers.contains(&id) {
                report.skipped += 1;
            } else if existing.contains(&id) {
                report.refreshes += 1;
                self.enqueue(SyncTask::UpdateLabelsForMessage {
                    account_id,
                    message_id: id,
                })?;
            } else {
                report.downloads += 1;
                self.enqueue(SyncTask::DownloadMessage {
                    account_id,
                    message_id: id,
                })?;
            }
        }

        self.enqueue(SyncTask::FirstSyncFinished {
            account_id: self.account_id().clone(),
        })?;
        accounts::set_history_id(self.db(), self.account_id(), listing.history_id).await?;
        Ok(report)
    }

    /// Applies the change stream since the stored cursor.
    ///
    /// Deleted ids win over any other change in the same batch. Downloads and
    /// refreshes are scheduled, deletions applied directly, then the cursor
    /// is stored. Counters are recomputed only when the cursor advanced.
    pub async fn sync_by_history(&self) -> Result<HistorySyncReport> {
        let account = self.account().await?;
        accounts::set_syncing(self.db(), self.account_id(), true).await?;

        let Some(since) = account.history_id else {
            tracing::info!(account_id = %self.account_id(), "no history cursor, scheduling full synchronization");
            if let Err(e) = self.enqueue(SyncTask::FullSynchronize {
                account_id: self.account_id().clone(),
            }) {
                self.reset_syncing().await;
                return Err(e);
            }
            return Ok(HistorySyncReport::FullSyncScheduled);
        };

        match self.apply_history(since).await {
            Ok(HistorySyncReport::FullSyncScheduled) => Ok(HistorySyncReport::FullSyncScheduled),
            Ok(report) => {
                accounts::set_syncing(self.db(), self.account_id(), false).await?;
                Ok(report)
            }
            Err(e) => {
                self.reset_syncing().await;
                Err(e)
            }
        }
    }

    async fn apply_history(&self, since: HistoryId) -> Result<HistorySyncReport> {
        let delta = match self.connector.get_history(since).await {
            Ok(delta) => delta,
            Err(ProviderError::NotFound(_)) => {
                tracing::warn!(
                    account_id = %self.account_id(),
                    since = %since,
                    "history cursor expired, scheduling full synchronization"
                );
                self.enqueue(SyncTask::FullSynchronize {
                    account_id: self.account_id().clone(),
                })?;
                return Ok(HistorySyncReport::FullSyncScheduled);
            }
            Err(e) => return Err(e.into()),
        };

        if delta.records.is_empty() {
            tracing::debug!(account_id = %self.account_id(), since = %since, "no changes");
            return Ok(HistorySyncReport::UpToDate);
        }

        let mut downloads = BTreeSet::new();
        let mut refreshes = BTreeSet::new();
        let mut deletions = BTreeSet::new();
        for record in &delta.records {
            for added in &record.messages_added {
                downloads.insert(EmailId(added.message.id.clone()));
            }
            for change in record.labels_added.iter().chain(&record.labels_removed) {
                refreshes.insert(EmailId(change.message.id.clone()));
            }
            for deleted in &record.messages_deleted {
                deletions.insert(EmailId(deleted.message.id.clone()));
            }
        }
        downloads.retain(|id| !deletions.contains(id));
        refreshes.retain(|id| !deletions.contains(id) && !downloads.contains(id));

        for id in &downloads {
            self.enqueue(SyncTask::DownloadMessage {
                account_id: self.account_id().clone(),
                message_id: id.clone(),
            })?;
        }
        for id in &refreshes {
            self.enqueue(SyncTask::UpdateLabelsForMessage {
                account_id: self.account_id().clone(),
                message_id: id.clone(),
            })?;
        }
        let deleted = self.delete_local(deletions.into_iter().collect()).await?;

        let advanced = delta.history_id > since;
        if advanced {
            accounts::set_history_id(self.db(), self.account_id(), delta.history_id).await?;
            self.recompute_unread().await?;
        }

        tracing::info!(
            account_id = %self.account_id(),
            since = %since,
            history_id = %delta.history_id,
            downloads = downloads.len(),
            refreshes = refreshes.len(),
            deleted,
            "applied history"
        );
        Ok(HistorySyncReport::Applied {
            previous: since,
            history_id: delta.history_id.max(since),
            downloads: downloads.len(),
            refreshes: refreshes.len(),
            deleted,
        })
    }

    /// Deletes stored messages and their attachment bytes. Returns how many
    /// were stored.
    async fn delete_local(&self, ids: Vec<EmailId>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let account_id = self.account_id().clone();
        let (deleted, keys) = self
            .db()
            .transaction(move |tx| {
                let mut deleted = 0;
                let mut keys = Vec::new();
                for id in &ids {
                    if let Some(blob_keys) = messages::delete(tx, &account_id, id)? {
                        deleted += 1;
                        keys.extend(blob_keys);
                    }
                }
                Ok((deleted, keys))
            })
            .await?;
        remove_blobs(&self.storage, &keys).await;
        Ok(deleted)
    }

    /// Downloads a message, or refreshes its labels if it is already stored.
    /// A message deleted remotely in the meantime is not an error.
    pub async fn download_message(&self, id: &EmailId) -> Result<DownloadOutcome> {
        let outcome = self.reconcile(id).await?;
        tracing::debug!(account_id = %self.account_id(), message_id = %id, ?outcome, "download finished");
        Ok(outcome)
    }

    /// Same reconciliation as [`Self::download_message`], entered from
    /// history label changes: a stored message gets its labels and thread
    /// refreshed, a missing one is downloaded.
    pub async fn update_labels_for_message(&self, id: &EmailId) -> Result<DownloadOutcome> {
        let outcome = self.reconcile(id).await?;
        tracing::debug!(account_id = %self.account_id(), message_id = %id, ?outcome, "label refresh finished");
        Ok(outcome)
    }

    async fn reconcile(&self, id: &EmailId) -> Result<DownloadOutcome> {
        let account_id = self.account_id().clone();
        let lookup = id.clone();
        let (marked, stored) = self
            .db()
            .with_conn(move |conn| {
                Ok((
                    no_messages::contains(conn, &account_id, &lookup)?,
                    messages::exists(conn, &account_id, &lookup)?,
                ))
            })
            .await?;

        let outcome = if marked {
            DownloadOutcome::Marked
        } else if stored {
            self.refresh_labels(id, None).await?
        } else {
            self.fetch_and_store(id, None).await?
        };
        if outcome.changed_mirror() {
            self.recompute_unread().await?;
        }
        Ok(outcome)
    }

    /// Fetches, builds and stores a message that is not stored yet.
    async fn fetch_and_store(&self, id: &EmailId, draft_id: Option<String>) -> Result<DownloadOutcome> {
        let remote = match self.connector.get_message(id).await {
            Ok(remote) => remote,
            Err(ProviderError::NotFound(_)) => {
                tracing::info!(account_id = %self.account_id(), message_id = %id, "message gone before download");
                return Ok(DownloadOutcome::Gone);
            }
            Err(e) => return Err(e.into()),
        };

        let mut built = MessageBuilder::new(&self.connector).build(&remote).await?;
        built.draft_id = draft_id;
        let local_labels = if built.is_mail() {
            LabelBuilder::new(self.db(), &self.connector)
                .resolve(&built.remote_labels)
                .await?
        } else {
            Vec::new()
        };

        let outcome = save_built_message(
            &self.storage,
            built,
            local_labels,
            &self.options.attachment_url_template,
        )
        .await?;
        Ok(match outcome {
            SaveOutcome::Saved => DownloadOutcome::Stored,
            SaveOutcome::NoMessage => DownloadOutcome::NotMail,
            SaveOutcome::AlreadyExists => self.refresh_labels(id, None).await?,
        })
    }

    /// Mirrors remote labels and thread onto a stored message when they
    /// differ. `known` is a short view the caller already fetched.
    async fn refresh_labels(&self, id: &EmailId, known: Option<ShortMessage>) -> Result<DownloadOutcome> {
        let short = match known {
            Some(short) => short,
            None => match self.connector.get_short_message(id).await {
                Ok(short) => short,
                Err(ProviderError::NotFound(_)) => {
                    tracing::info!(account_id = %self.account_id(), message_id = %id, "message gone before label refresh");
                    return Ok(DownloadOutcome::Gone);
                }
                Err(e) => return Err(e.into()),
            },
        };

        let account_id = self.account_id().clone();
        let lookup = id.clone();
        let stored = self
            .db()
            .with_conn(move |conn| messages::get(conn, &account_id, &lookup))
            .await?;
        let Some(stored) = stored else {
            tracing::debug!(account_id = %self.account_id(), message_id = %id, "message removed locally during refresh");
            return Ok(DownloadOutcome::Unchanged);
        };

        let unread = system_labels::unread();
        let mut local: HashSet<LabelId> = stored.labels.iter().cloned().collect();
        if !stored.is_read {
            local.insert(unread.clone());
        }
        let remote: HashSet<LabelId> = short.label_ids.iter().map(|l| LabelId(l.clone())).collect();
        let thread_id = ThreadId(short.thread_id.clone());

        if local == remote && stored.thread_id == thread_id {
            return Ok(DownloadOutcome::Unchanged);
        }

        let remote_ids: Vec<LabelId> = short.label_ids.iter().map(|l| LabelId(l.clone())).collect();
        let mut resolved = LabelBuilder::new(self.db(), &self.connector)
            .resolve(&remote_ids)
            .await?;
        if remote.contains(&unread) {
            resolved.push(unread);
        }

        let account_id = self.account_id().clone();
        let message_id = id.clone();
        self.db()
            .transaction(move |tx| {
                messages::apply_remote_labels(tx, &account_id, &message_id, &thread_id, &resolved)
            })
            .await?;
        tracing::debug!(account_id = %self.account_id(), message_id = %id, "refreshed labels");
        Ok(DownloadOutcome::LabelsRefreshed)
    }

    /// Adds and removes labels on a message, remotely then locally.
    ///
    /// Each attempt refetches the message's labels and sends only the real
    /// delta. `SENT` is never added. With `remove_all`, every label except
    /// `UNREAD`, `SENT` and `DRAFT` is removed. Counters are recomputed
    /// whatever the outcome.
    pub async fn add_and_remove_labels(
        &self,
        id: &EmailId,
        add: &[LabelId],
        remove: &[LabelId],
        remove_all: bool,
    ) -> Result<LabelUpdateOutcome> {
        let result = self.modify_labels(id, add, remove, remove_all).await;
        self.recompute_unread().await?;
        result
    }

    async fn modify_labels(
        &self,
        id: &EmailId,
        add: &[LabelId],
        remove: &[LabelId],
        remove_all: bool,
    ) -> Result<LabelUpdateOutcome> {
        let sent = system_labels::sent();
        let kept = kept_on_archive();

        for attempt in 1..=self.options.label_update_attempts {
            let short = match self.connector.get_short_message(id).await {
                Ok(short) => short,
                Err(ProviderError::NotFound(_)) => return Ok(LabelUpdateOutcome::Gone),
                Err(e) => return Err(e.into()),
            };
            let current: HashSet<LabelId> = short.label_ids.iter().map(|l| LabelId(l.clone())).collect();

            let mut to_add: Vec<LabelId> = Vec::new();
            for label in add {
                if *label != sent
                    && !remove.contains(label)
                    && !current.contains(label)
                    && !to_add.contains(label)
                {
                    to_add.push(label.clone());
                }
            }
            let to_remove: Vec<LabelId> = if remove_all {
                let mut all: Vec<LabelId> = current.iter().filter(|l| !kept.contains(l)).cloned().collect();
                all.sort();
                all
            } else {
                let mut requested = Vec::new();
                for label in remove {
                    if current.contains(label) && !requested.contains(label) {
                        requested.push(label.clone());
                    }
                }
                requested
            };

            if to_add.is_empty() && to_remove.is_empty() {
                tracing::debug!(account_id = %self.account_id(), message_id = %id, "labels already as requested");
                return Ok(LabelUpdateOutcome::NothingToChange);
            }

            let updated = match self.connector.update_labels(id, &to_add, &to_remove).await {
                Ok(updated) => updated,
                Err(ProviderError::LabelNotFound(message)) => {
                    tracing::warn!(
                        account_id = %self.account_id(),
                        message_id = %id,
                        error = %message,
                        "label unknown remotely, giving up"
                    );
                    return Ok(LabelUpdateOutcome::LabelNotFound);
                }
                Err(e) => return Err(e.into()),
            };

            let reflected = to_add.iter().all(|l| updated.label_ids.contains(&l.0))
                && to_remove.iter().all(|l| !updated.label_ids.contains(&l.0));
            if !reflected {
                tracing::warn!(
                    account_id = %self.account_id(),
                    message_id = %id,
                    attempt,
                    "label change not reflected remotely, retrying"
                );
                continue;
            }

            self.mirror_label_delta(id, &to_add, &to_remove).await?;
            tracing::info!(
                account_id = %self.account_id(),
                message_id = %id,
                added = ?to_add,
                removed = ?to_remove,
                "updated labels"
            );
            return Ok(LabelUpdateOutcome::Applied {
                added: to_add,
                removed: to_remove,
            });
        }

        tracing::warn!(account_id = %self.account_id(), message_id = %id, "label update attempts exhausted");
        Ok(LabelUpdateOutcome::Exhausted)
    }

    async fn mirror_label_delta(&self, id: &EmailId, add: &[LabelId], remove: &[LabelId]) -> Result<()> {
        let unread = system_labels::unread();
        let links = LabelBuilder::new(self.db(), &self.connector).resolve(add).await?;
        let read_change = if add.contains(&unread) {
            Some(false)
        } else if remove.contains(&unread) {
            Some(true)
        } else {
            None
        };
        let unlinks: Vec<LabelId> = remove.iter().filter(|l| **l != unread).cloned().collect();

        let account_id = self.account_id().clone();
        let message_id = id.clone();
        let mirrored = self
            .db()
            .transaction(move |tx| {
                if !messages::exists(tx, &account_id, &message_id)? {
                    return Ok(false);
                }
                for label in &links {
                    labels::link(tx, &account_id, &message_id, label)?;
                }
                for label in &unlinks {
                    labels::unlink(tx, &account_id, &message_id, label)?;
                }
                if let Some(read) = read_change {
                    messages::set_read(tx, &account_id, &message_id, read)?;
                }
                Ok(true)
            })
            .await?;
        if !mirrored {
            tracing::debug!(account_id = %self.account_id(), message_id = %id, "message not stored locally, remote change only");
        }
        Ok(())
    }

    pub async fn star(&self, id: &EmailId) -> Result<LabelUpdateOutcome> {
        self.add_and_remove_labels(id, &[system_labels::starred()], &[], false)
            .await
    }

    pub async fn unstar(&self, id: &EmailId) -> Result<LabelUpdateOutcome> {
        self.add_and_remove_labels(id, &[], &[system_labels::starred()], false)
            .await
    }

    pub async fn mark_read(&self, id: &EmailId) -> Result<LabelUpdateOutcome> {
        self.add_and_remove_labels(id, &[], &[system_labels::unread()], false)
            .await
    }

    pub async fn mark_unread(&self, id: &EmailId) -> Result<LabelUpdateOutcome> {
        self.add_and_remove_labels(id, &[system_labels::unread()], &[], false)
            .await
    }

    /// Moves a message to spam, out of the inbox.
    pub async fn mark_spam(&self, id: &EmailId) -> Result<LabelUpdateOutcome> {
        self.add_and_remove_labels(id, &[system_labels::spam()], &[system_labels::inbox()], false)
            .await
    }

    /// Moves a message from spam back to the inbox.
    pub async fn unmark_spam(&self, id: &EmailId) -> Result<LabelUpdateOutcome> {
        self.add_and_remove_labels(id, &[system_labels::inbox()], &[system_labels::spam()], false)
            .await
    }

    /// Removes every label except `UNREAD`, `SENT` and `DRAFT`.
    pub async fn archive(&self, id: &EmailId) -> Result<LabelUpdateOutcome> {
        self.add_and_remove_labels(id, &[], &[], true).await
    }

    /// Trashes a message. A message already gone remotely counts as done.
    pub async fn trash(&self, id: &EmailId) -> Result<DownloadOutcome> {
        let outcome = match self.connector.trash(id).await {
            Ok(short) => self.refresh_labels(id, Some(short)).await?,
            Err(ProviderError::NotFound(_)) => {
                tracing::info!(account_id = %self.account_id(), message_id = %id, "message already gone, nothing to trash");
                DownloadOutcome::Gone
            }
            Err(e) => return Err(e.into()),
        };
        self.recompute_unread().await?;
        Ok(outcome)
    }

    /// Permanently deletes a message, remotely and locally. A message
    /// already gone remotely counts as done.
    pub async fn delete(&self, id: &EmailId) -> Result<()> {
        match self.connector.delete(id).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                tracing::info!(account_id = %self.account_id(), message_id = %id, "message already gone remotely");
            }
            Err(e) => return Err(e.into()),
        }
        self.delete_local(vec![id.clone()]).await?;
        self.recompute_unread().await?;
        Ok(())
    }

    async fn load_draft(&self, draft_id: &DraftId) -> Result<OutboundDraft> {
        let draft = drafts::get(self.db(), draft_id)
            .await?
            .ok_or_else(|| SyncError::DraftNotFound(draft_id.clone()))?;
        if draft.account_id != *self.account_id() {
            return Err(SyncError::DraftNotFound(draft_id.clone()));
        }
        Ok(draft)
    }

    async fn consume_draft(&self, draft_id: &DraftId) {
        match drafts::delete(self.db(), draft_id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(draft_id = %draft_id, "draft already consumed"),
            Err(e) => tracing::error!(draft_id = %draft_id, error = %e, "failed to delete consumed draft"),
        }
    }

    /// Sends an outbound draft and stores the sent message. The draft is
    /// deleted once the remote accepted it, and kept on failure.
    pub async fn send(&self, draft_id: &DraftId) -> Result<EmailId> {
        let draft = self.load_draft(draft_id).await?;
        draft.validate_for_send()?;
        let account = self.account().await?;
        let composed = compose(&self.storage, &account.email, &draft).await?;

        let sent = self
            .connector
            .send(&composed.raw, composed.thread_id.as_ref().map(ThreadId::as_str))
            .await?;
        self.consume_draft(draft_id).await;

        let id = EmailId(sent.id);
        tracing::info!(account_id = %self.account_id(), message_id = %id, draft_id = %draft_id, "sent message");
        self.fetch_and_store(&id, None).await?;
        self.recompute_unread().await?;
        Ok(id)
    }

    /// Saves an outbound draft as a new remote draft and stores its message.
    /// Returns the remote draft id.
    pub async fn create_draft(&self, draft_id: &DraftId) -> Result<String> {
        let draft = self.load_draft(draft_id).await?;
        let account = self.account().await?;
        let composed = compose(&self.storage, &account.email, &draft).await?;

        let remote = self
            .connector
            .create_draft(&composed.raw, composed.thread_id.as_ref().map(ThreadId::as_str))
            .await?;
        self.consume_draft(draft_id).await;

        tracing::info!(account_id = %self.account_id(), remote_draft_id = %remote.id, "created remote draft");
        self.fetch_and_store(&EmailId(remote.message.id), Some(remote.id.clone()))
            .await?;
        self.recompute_unread().await?;
        Ok(remote.id)
    }

    /// Replaces the remote draft an outbound draft edits, and swaps the
    /// stored message. Creates the remote draft when it has none yet.
    pub async fn update_draft(&self, draft_id: &DraftId) -> Result<String> {
        let draft = self.load_draft(draft_id).await?;
        let Some(remote_draft_id) = draft.remote_draft_id.clone() else {
            return self.create_draft(draft_id).await;
        };
        let account = self.account().await?;
        let composed = compose(&self.storage, &account.email, &draft).await?;

        let remote = self
            .connector
            .update_draft(
                &remote_draft_id,
                &composed.raw,
                composed.thread_id.as_ref().map(ThreadId::as_str),
            )
            .await?;
        self.consume_draft(draft_id).await;

        self.delete_draft_mirror(&remote_draft_id).await?;
        tracing::info!(account_id = %self.account_id(), remote_draft_id = %remote.id, "updated remote draft");
        self.fetch_and_store(&EmailId(remote.message.id), Some(remote.id.clone()))
            .await?;
        self.recompute_unread().await?;
        Ok(remote.id)
    }

    /// Deletes a remote draft and its stored message. A draft already gone
    /// remotely counts as done.
    pub async fn delete_draft(&self, remote_draft_id: &str) -> Result<()> {
        match self.connector.delete_draft(remote_draft_id).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                tracing::info!(account_id = %self.account_id(), remote_draft_id, "draft already gone remotely");
            }
            Err(e) => return Err(e.into()),
        }
        self.delete_draft_mirror(remote_draft_id).await?;
        self.recompute_unread().await?;
        Ok(())
    }

    async fn delete_draft_mirror(&self, remote_draft_id: &str) -> Result<()> {
        let account_id = self.account_id().clone();
        let draft = remote_draft_id.to_string();
        let stored = self
            .db()
            .with_conn(move |conn| messages::find_by_draft_id(conn, &account_id, &draft))
            .await?;
        if let Some(id) = stored {
            self.delete_local(vec![id]).await?;
        }
        Ok(())
    }

    /// Marks the first full synchronization complete.
    pub async fn first_sync_finished(&self) -> Result<()> {
        accounts::finish_first_sync(self.db(), self.account_id(), Utc::now()).await?;
        self.recompute_unread().await?;
        tracing::info!(account_id = %self.account_id(), "first synchronization finished");
        Ok(())
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("connector", &self.connector)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
