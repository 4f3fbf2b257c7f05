//! End-to-end synchronization against an in-memory remote mailbox.
//!
//! Each test drives the public task pipeline (scheduler, queue, worker,
//! manager) and checks the local mirror afterwards.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use mailmirror::domain::{
    AccountId, DraftKind, EmailId, LabelId, MailAccount, OutboundDraft, Recipient,
};
use mailmirror::providers::email::{GmailApi, InMemoryMailbox, RetryPolicy};
use mailmirror::services::{
    FullSyncReport, HistorySyncReport, LabelUpdateOutcome, LocalTaskQueue, ManagerFactory,
    ScheduleDecision, Scheduler, SyncError, SyncManager, TaskReceiver, TaskWorker, WorkerOptions,
};
use mailmirror::storage::queries::{accounts, drafts, labels, messages, no_messages};
use mailmirror::storage::StorageLayer;

// ============================================================================
// Harness
// ============================================================================

fn mail(id: &str) -> String {
    format!(
        "From: Alice <alice@example.com>\r\n\
To: Bob <bob@example.com>\r\n\
Subject: Message {id}\r\n\
Date: Tue, 4 Mar 2025 10:15:00 +0000\r\n\
Message-ID: <{id}@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello from {id}\r\n"
    )
}

struct Mirror {
    mailbox: Arc<InMemoryMailbox>,
    storage: StorageLayer,
    factory: Arc<ManagerFactory>,
    scheduler: Scheduler,
    worker: TaskWorker,
    rx: TaskReceiver,
    account: AccountId,
    _dir: tempfile::TempDir,
}

impl Mirror {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayer::in_memory(dir.path()).await.unwrap();
        accounts::insert(storage.db(), &MailAccount::new("acc", "bob@example.com"))
            .await
            .unwrap();

        let mailbox = Arc::new(InMemoryMailbox::new("bob@example.com"));
        let remote = mailbox.clone();
        let apis = move |_: &MailAccount| -> Result<Arc<dyn GmailApi>, SyncError> {
            let api: Arc<dyn GmailApi> = remote.clone();
            Ok(api)
        };

        let (queue, rx) = LocalTaskQueue::new();
        let queue = Arc::new(queue);
        let factory = Arc::new(
            ManagerFactory::new(storage.clone(), Arc::new(apis), queue.clone()).with_policy(
                RetryPolicy {
                    max_attempts: 2,
                    backoff_unit: Duration::from_millis(1),
                },
            ),
        );
        let worker = TaskWorker::new(
            factory.clone(),
            WorkerOptions {
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
                concurrency: 1,
            },
        );
        let scheduler = Scheduler::new(storage.db().clone(), queue);

        Self {
            mailbox,
            storage,
            factory,
            scheduler,
            worker,
            rx,
            account: AccountId::from("acc"),
            _dir: dir,
        }
    }

    /// Ten mails, the first four unread, plus two chats.
    fn seed(&self) {
        for i in 1..=10 {
            let id = format!("m{i}");
            let labels: &[&str] = if i <= 4 { &["INBOX", "UNREAD"] } else { &["INBOX"] };
            self.mailbox
                .insert_raw(&id, &format!("t{i}"), labels, mail(&id).as_bytes())
                .unwrap();
        }
        self.mailbox.insert_chat("c1");
        self.mailbox.insert_chat("c2");
    }

    async fn manager(&self) -> SyncManager {
        self.factory.manager_for(&self.account).await.unwrap().unwrap()
    }

    async fn sync(&mut self) -> (ScheduleDecision, usize) {
        let decision = self.scheduler.schedule_sync(&self.account).await.unwrap();
        let ran = self.worker.run_until_idle(&mut self.rx).await;
        (decision, ran)
    }

    async fn account(&self) -> MailAccount {
        accounts::get_by_id(self.storage.db(), &self.account)
            .await
            .unwrap()
            .unwrap()
    }

    async fn message_count(&self) -> u64 {
        let account = self.account.clone();
        self.storage
            .db()
            .with_conn(move |conn| messages::count(conn, &account))
            .await
            .unwrap()
    }

    async fn marker_count(&self) -> usize {
        let account = self.account.clone();
        self.storage
            .db()
            .with_conn(move |conn| no_messages::ids_for_account(conn, &account))
            .await
            .unwrap()
            .len()
    }

    async fn unread(&self, label: &str) -> u32 {
        let account = self.account.clone();
        let label = LabelId::from(label);
        self.storage
            .db()
            .with_conn(move |conn| labels::get(conn, &account, &label))
            .await
            .unwrap()
            .map(|l| l.unread)
            .unwrap_or_default()
    }

    async fn local_labels(&self, id: &str) -> Vec<LabelId> {
        let account = self.account.clone();
        let id = EmailId::from(id);
        self.storage
            .db()
            .with_conn(move |conn| labels::for_message(conn, &account, &id))
            .await
            .unwrap()
    }

    async fn stored(&self, id: &str) -> Option<mailmirror::domain::Message> {
        let account = self.account.clone();
        let id = EmailId::from(id);
        self.storage
            .db()
            .with_conn(move |conn| messages::get(conn, &account, &id))
            .await
            .unwrap()
    }
}

// ============================================================================
// Full synchronization
// ============================================================================

#[tokio::test]
async fn full_sync_mirrors_mail_and_marks_chats() {
    let mut mirror = Mirror::new().await;
    mirror.seed();

    let (decision, ran) = mirror.sync().await;

    assert_eq!(decision, ScheduleDecision::FullSync);
    // full sync, twelve downloads, completion
    assert_eq!(ran, 14);
    assert_eq!(mirror.message_count().await, 10);
    assert_eq!(mirror.marker_count().await, 2);

    let account = mirror.account().await;
    assert_eq!(account.history_id, Some(mirror.mailbox.history_id()));
    assert!(account.first_sync_finished_at.is_some());
    assert!(!account.is_syncing);

    assert_eq!(mirror.unread("INBOX").await, 4);
    let first = mirror.stored("m1").await.unwrap();
    assert_eq!(first.subject, "Message m1");
    assert_eq!(first.sender.email, "alice@example.com");
    assert!(!first.is_read);
    assert!(mirror.stored("m5").await.unwrap().is_read);
}

#[tokio::test]
async fn repeated_full_sync_refreshes_and_skips_markers() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;

    let report = mirror.manager().await.full_synchronize().await.unwrap();

    assert_eq!(
        report,
        FullSyncReport {
            history_id: mirror.mailbox.history_id(),
            listed: 12,
            skipped: 2,
            refreshes: 10,
            downloads: 0,
        }
    );
    mirror.worker.run_until_idle(&mut mirror.rx).await;
    assert_eq!(mirror.message_count().await, 10);
    assert_eq!(mirror.marker_count().await, 2);
}

// ============================================================================
// Incremental synchronization
// ============================================================================

#[tokio::test]
async fn history_applies_changes_and_deletions_win() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;
    let before = mirror.account().await.history_id.unwrap();

    mirror
        .mailbox
        .deliver_raw("m11", "t11", &["INBOX", "UNREAD"], mail("m11").as_bytes())
        .unwrap();
    mirror.mailbox.relabel("m1", &["STARRED"], &["UNREAD"]).unwrap();
    mirror.mailbox.expunge("m2");
    mirror.mailbox.relabel("m3", &["STARRED"], &[]).unwrap();
    mirror.mailbox.expunge("m3");
    mirror
        .mailbox
        .deliver_raw("m12", "t12", &["INBOX"], mail("m12").as_bytes())
        .unwrap();
    mirror.mailbox.expunge("m12");

    let report = mirror.manager().await.sync_by_history().await.unwrap();

    assert_eq!(
        report,
        HistorySyncReport::Applied {
            previous: before,
            history_id: mirror.mailbox.history_id(),
            downloads: 1,
            refreshes: 1,
            deleted: 2,
        }
    );
    assert!(mirror.stored("m2").await.is_none());
    assert!(mirror.stored("m3").await.is_none());

    mirror.worker.run_until_idle(&mut mirror.rx).await;

    assert!(mirror.stored("m11").await.is_some());
    assert!(mirror.stored("m12").await.is_none());
    assert_eq!(
        mirror.local_labels("m1").await,
        vec![LabelId::from("INBOX"), LabelId::from("STARRED")]
    );
    assert!(mirror.stored("m1").await.unwrap().is_read);
    // m4 and m11
    assert_eq!(mirror.unread("INBOX").await, 2);
    assert_eq!(mirror.message_count().await, 9);

    let account = mirror.account().await;
    assert_eq!(account.history_id, Some(mirror.mailbox.history_id()));
    assert!(!account.is_syncing);
}

#[tokio::test]
async fn remote_spam_applies_only_the_reported_delta() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;

    mirror.mailbox.relabel("m5", &["SPAM"], &[]).unwrap();
    mirror.sync().await;

    assert_eq!(
        mirror.local_labels("m5").await,
        vec![LabelId::from("INBOX"), LabelId::from("SPAM")]
    );
}

#[tokio::test]
async fn scheduler_picks_incremental_after_first_sync() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;

    mirror
        .mailbox
        .deliver_raw("m11", "t11", &["INBOX"], mail("m11").as_bytes())
        .unwrap();
    let (decision, ran) = mirror.sync().await;

    assert_eq!(decision, ScheduleDecision::Incremental);
    assert_eq!(ran, 2);
    assert_eq!(mirror.message_count().await, 11);
}

#[tokio::test]
async fn downloads_are_idempotent() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;
    let manager = mirror.manager().await;

    for _ in 0..3 {
        manager.download_message(&EmailId::from("m1")).await.unwrap();
        manager.download_message(&EmailId::from("c1")).await.unwrap();
    }

    assert_eq!(mirror.message_count().await, 10);
    assert_eq!(mirror.marker_count().await, 2);
    assert_eq!(mirror.unread("INBOX").await, 4);
}

// ============================================================================
// Label mutations
// ============================================================================

#[tokio::test]
async fn spam_round_trip_updates_remote_and_mirror() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;
    let manager = mirror.manager().await;
    let id = EmailId::from("m1");

    let outcome = manager.mark_spam(&id).await.unwrap();

    assert_eq!(
        outcome,
        LabelUpdateOutcome::Applied {
            added: vec![LabelId::from("SPAM")],
            removed: vec![LabelId::from("INBOX")],
        }
    );
    let mut remote = mirror.mailbox.label_ids("m1").unwrap();
    remote.sort();
    assert_eq!(remote, vec!["SPAM".to_string(), "UNREAD".to_string()]);
    assert_eq!(mirror.local_labels("m1").await, vec![LabelId::from("SPAM")]);
    assert_eq!(mirror.unread("INBOX").await, 3);
    assert_eq!(mirror.unread("SPAM").await, 1);

    manager.unmark_spam(&id).await.unwrap();
    assert_eq!(mirror.local_labels("m1").await, vec![LabelId::from("INBOX")]);
    assert_eq!(mirror.unread("INBOX").await, 4);

    // the incremental run sees its own changes and leaves the mirror alone
    mirror.sync().await;
    assert_eq!(mirror.local_labels("m1").await, vec![LabelId::from("INBOX")]);
}

#[tokio::test]
async fn star_and_read_changes_are_mirrored() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;
    let manager = mirror.manager().await;
    let id = EmailId::from("m2");

    manager.star(&id).await.unwrap();
    manager.mark_read(&id).await.unwrap();

    assert_eq!(
        mirror.local_labels("m2").await,
        vec![LabelId::from("INBOX"), LabelId::from("STARRED")]
    );
    assert!(mirror.stored("m2").await.unwrap().is_read);
    assert_eq!(mirror.unread("INBOX").await, 3);

    manager.unstar(&id).await.unwrap();
    assert_eq!(mirror.local_labels("m2").await, vec![LabelId::from("INBOX")]);
}

// ============================================================================
// Sending and drafts
// ============================================================================

async fn outbound(mirror: &Mirror, subject: &str, remote_draft_id: Option<&str>) -> OutboundDraft {
    let mut draft = OutboundDraft::new(mirror.account.clone(), DraftKind::Compose, None);
    draft.remote_draft_id = remote_draft_id.map(str::to_string);
    draft.to.push(Recipient::with_name("erin@example.com", "Erin"));
    draft.subject = subject.to_string();
    draft.body_text = "See you there".to_string();
    draft.body_html = "<p>See you there</p>".to_string();
    drafts::insert(mirror.storage.db(), &draft).await.unwrap();
    draft
}

#[tokio::test]
async fn send_stores_the_sent_message_and_consumes_the_draft() {
    let mut mirror = Mirror::new().await;
    mirror.seed();
    mirror.sync().await;
    let draft = outbound(&mirror, "Lunch", None).await;

    let sent = mirror.manager().await.send(&draft.id).await.unwrap();

    assert_eq!(mirror.mailbox.sent_raw().len(), 1);
    assert!(drafts::get(mirror.storage.db(), &draft.id).await.unwrap().is_none());
    let stored = mirror.stored(sent.as_str()).await.unwrap();
    assert_eq!(stored.subject, "Lunch");
    assert_eq!(stored.to[0].email, "erin@example.com");
    assert_eq!(mirror.local_labels(sent.as_str()).await, vec![LabelId::from("SENT")]);
}

#[tokio::test]
async fn send_without_recipients_keeps_the_draft() {
    let mirror = Mirror::new().await;
    let mut draft = OutboundDraft::new(mirror.account.clone(), DraftKind::Compose, None);
    draft.subject = "Nobody".to_string();
    drafts::insert(mirror.storage.db(), &draft).await.unwrap();

    let err = mirror.manager().await.send(&draft.id).await.unwrap_err();

    assert!(err.is_permanent());
    assert!(mirror.mailbox.sent_raw().is_empty());
    assert!(drafts::get(mirror.storage.db(), &draft.id).await.unwrap().is_some());
}

#[tokio::test]
async fn draft_lifecycle_tracks_the_remote_draft() {
    let mirror = Mirror::new().await;
    let manager = mirror.manager().await;

    let first = outbound(&mirror, "Plan v1", None).await;
    let remote_id = manager.create_draft(&first.id).await.unwrap();
    let first_message = mirror.mailbox.draft_message_id(&remote_id).unwrap();
    let stored = mirror.stored(&first_message).await.unwrap();
    assert_eq!(stored.draft_id.as_deref(), Some(remote_id.as_str()));
    assert_eq!(mirror.local_labels(&first_message).await, vec![LabelId::from("DRAFT")]);

    let second = outbound(&mirror, "Plan v2", Some(&remote_id)).await;
    let updated = manager.update_draft(&second.id).await.unwrap();

    assert_eq!(updated, remote_id);
    let second_message = mirror.mailbox.draft_message_id(&remote_id).unwrap();
    assert_ne!(second_message, first_message);
    assert!(mirror.stored(&first_message).await.is_none());
    assert_eq!(mirror.stored(&second_message).await.unwrap().subject, "Plan v2");

    manager.delete_draft(&remote_id).await.unwrap();
    assert!(mirror.stored(&second_message).await.is_none());
    assert_eq!(mirror.message_count().await, 0);

    // already gone remotely
    manager.delete_draft(&remote_id).await.unwrap();
}
