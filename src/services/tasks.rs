//! Background task dispatch.
//!
//! Synchronization work is broken into [`SyncTask`]s. The [`Scheduler`]
//! decides per account whether a full or incremental run is due and queues
//! it; the [`SyncManager`](super::SyncManager) queues per-message follow-ups
//! while it runs. A [`TaskWorker`] drains the queue with bounded concurrency
//! and retries failed tasks with a linear delay.
//!
//! Tasks carry only ids and re-read state when they run, so running the
//! same task twice is harmless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::sync_service::{SyncManager, SyncOptions};
use super::{Result, SyncError};
use crate::config::{Settings, TaskSettings};
use crate::domain::{AccountId, EmailId, MailAccount};
use crate::providers::email::{Connector, GmailApi, RetryPolicy};
use crate::storage::queries::accounts;
use crate::storage::{Database, StorageLayer};

/// A unit of synchronization work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum SyncTask {
    FullSynchronize { account_id: AccountId },
    SyncByHistory { account_id: AccountId },
    DownloadMessage { account_id: AccountId, message_id: EmailId },
    UpdateLabelsForMessage { account_id: AccountId, message_id: EmailId },
    FirstSyncFinished { account_id: AccountId },
}

impl SyncTask {
    /// Account the task runs against.
    pub fn account_id(&self) -> &AccountId {
        match self {
            SyncTask::FullSynchronize { account_id }
            | SyncTask::SyncByHistory { account_id }
            | SyncTask::DownloadMessage { account_id, .. }
            | SyncTask::UpdateLabelsForMessage { account_id, .. }
            | SyncTask::FirstSyncFinished { account_id } => account_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SyncTask::FullSynchronize { .. } => "full_synchronize",
            SyncTask::SyncByHistory { .. } => "sync_by_history",
            SyncTask::DownloadMessage { .. } => "download_message",
            SyncTask::UpdateLabelsForMessage { .. } => "update_labels_for_message",
            SyncTask::FirstSyncFinished { .. } => "first_sync_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
}

/// Destination of queued tasks.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: SyncTask) -> std::result::Result<(), QueueError>;
}

/// In-process queue over an unbounded channel.
///
/// Unbounded, since a full synchronization queues one task per listed
/// message from inside a running task.
#[derive(Debug, Clone)]
pub struct LocalTaskQueue {
    tx: mpsc::UnboundedSender<SyncTask>,
}

impl LocalTaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver { rx })
    }
}

impl TaskQueue for LocalTaskQueue {
    fn enqueue(&self, task: SyncTask) -> std::result::Result<(), QueueError> {
        tracing::trace!(task = task.name(), account_id = %task.account_id(), "queued task");
        self.tx.send(task).map_err(|_| QueueError::Closed)
    }
}

/// Receiving end of a [`LocalTaskQueue`].
#[derive(Debug)]
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<SyncTask>,
}

impl TaskReceiver {
    /// Waits for the next task. `None` once every queue handle is dropped.
    pub async fn recv(&mut self) -> Option<SyncTask> {
        self.rx.recv().await
    }

    /// Next task if one is ready.
    pub fn try_recv(&mut self) -> Option<SyncTask> {
        self.rx.try_recv().ok()
    }
}

/// Executes one task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &SyncTask) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Retries after the first failed run.
    pub max_retries: u32,
    /// Retry `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
    /// Tasks running at once.
    pub concurrency: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_settings(&TaskSettings::default())
    }
}

impl WorkerOptions {
    /// Options from the `tasks` settings section. Concurrency is at least one.
    pub fn from_settings(settings: &TaskSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
            concurrency: settings.concurrency.max(1),
        }
    }
}

/// Drains a task queue.
#[derive(Clone)]
pub struct TaskWorker {
    handler: Arc<dyn TaskHandler>,
    options: WorkerOptions,
}

impl TaskWorker {
    pub fn new(handler: Arc<dyn TaskHandler>, options: WorkerOptions) -> Self {
        Self { handler, options }
    }

    /// Runs tasks as they arrive until every queue handle is dropped and
    /// the running tasks have finished.
    ///
    /// At most `concurrency` tasks execute at once. A task waiting to retry
    /// does not hold a slot.
    pub async fn run(&self, mut rx: TaskReceiver) {
        let slots = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(task) => {
                        let worker = self.clone();
                        let slots = slots.clone();
                        running.spawn(async move { worker.execute(task, &slots).await });
                    }
                    None => break,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "task panicked");
                    }
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "task panicked");
            }
        }
        tracing::info!("task queue closed, worker stopped");
    }

    /// Runs queued tasks one at a time, including tasks they queue, until
    /// the queue is empty. Returns how many tasks succeeded.
    pub async fn run_until_idle(&self, rx: &mut TaskReceiver) -> usize {
        let slots = Semaphore::new(1);
        let mut succeeded = 0;
        while let Some(task) = rx.try_recv() {
            if self.execute(task, &slots).await {
                succeeded += 1;
            }
        }
        succeeded
    }

    async fn execute(&self, task: SyncTask, slots: &Semaphore) -> bool {
        let mut attempt = 0;
        loop {
            let result = {
                let Ok(_permit) = slots.acquire().await else {
                    return false;
                };
                self.handler.handle(&task).await
            };

            let err = match result {
                Ok(()) => {
                    tracing::debug!(task = task.name(), account_id = %task.account_id(), attempt, "task finished");
                    return true;
                }
                Err(e) => e,
            };

            if err.is_permanent() {
                tracing::error!(task = task.name(), account_id = %task.account_id(), error = %err, "task failed permanently");
                return false;
            }
            if attempt >= self.options.max_retries {
                tracing::error!(
                    task = task.name(),
                    account_id = %task.account_id(),
                    attempts = attempt + 1,
                    error = %err,
                    "task failed, retries exhausted"
                );
                return false;
            }

            attempt += 1;
            let delay = self.options.retry_delay.saturating_mul(attempt);
            tracing::warn!(
                task = task.name(),
                account_id = %task.account_id(),
                attempt,
                delay_secs = delay.as_secs(),
                error = %err,
                "task failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Why the scheduler left an account alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Deauthorized,
    Deleted,
    AlreadySyncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    FullSync,
    Incremental,
    Skipped(SkipReason),
}

/// Queues the synchronization run each account needs.
pub struct Scheduler {
    db: Database,
    queue: Arc<dyn TaskQueue>,
}

impl Scheduler {
    pub fn new(db: Database, queue: Arc<dyn TaskQueue>) -> Self {
        Self { db, queue }
    }

    /// Schedules one account.
    pub async fn schedule_sync(&self, account_id: &AccountId) -> Result<ScheduleDecision> {
        let account = accounts::get_by_id(&self.db, account_id)
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(account_id.clone()))?;
        self.schedule(&account).await
    }

    /// Schedules every account that is not deleted.
    pub async fn schedule_all(&self) -> Result<Vec<(AccountId, ScheduleDecision)>> {
        let mut decisions = Vec::new();
        for account in accounts::get_active(&self.db).await? {
            let decision = self.schedule(&account).await?;
            decisions.push((account.id, decision));
        }
        Ok(decisions)
    }

    async fn schedule(&self, account: &MailAccount) -> Result<ScheduleDecision> {
        let skip = if account.deleted {
            Some(SkipReason::Deleted)
        } else if !account.authorized {
            Some(SkipReason::Deauthorized)
        } else if account.is_syncing {
            Some(SkipReason::AlreadySyncing)
        } else {
            None
        };
        if let Some(reason) = skip {
            tracing::debug!(account_id = %account.id, ?reason, "not scheduling sync");
            return Ok(ScheduleDecision::Skipped(reason));
        }

        let full = account.history_id.is_none() || account.first_sync_finished_at.is_none();
        let (task, decision) = if full {
            (
                SyncTask::FullSynchronize {
                    account_id: account.id.clone(),
                },
                ScheduleDecision::FullSync,
            )
        } else {
            (
                SyncTask::SyncByHistory {
                    account_id: account.id.clone(),
                },
                ScheduleDecision::Incremental,
            )
        };

        accounts::set_syncing(&self.db, &account.id, true).await?;
        if let Err(e) = self.queue.enqueue(task) {
            accounts::set_syncing(&self.db, &account.id, false).await?;
            return Err(e.into());
        }
        tracing::info!(account_id = %account.id, ?decision, "scheduled sync");
        Ok(decision)
    }
}

/// Supplies the remote API for an account.
pub trait ApiFactory: Send + Sync {
    fn api_for(&self, account: &MailAccount) -> Result<Arc<dyn GmailApi>>;
}

impl<F> ApiFactory for F
where
    F: Fn(&MailAccount) -> Result<Arc<dyn GmailApi>> + Send + Sync,
{
    fn api_for(&self, account: &MailAccount) -> Result<Arc<dyn GmailApi>> {
        self(account)
    }
}

/// Builds a [`SyncManager`] per task and dispatches the task to it.
pub struct ManagerFactory {
    storage: StorageLayer,
    apis: Arc<dyn ApiFactory>,
    queue: Arc<dyn TaskQueue>,
    options: SyncOptions,
    policy: RetryPolicy,
    excluded_query: Option<String>,
}

impl ManagerFactory {
    pub fn new(storage: StorageLayer, apis: Arc<dyn ApiFactory>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            storage,
            apis,
            queue,
            options: SyncOptions::default(),
            policy: RetryPolicy::default(),
            excluded_query: None,
        }
    }

    /// Applies the sync, retry and storage settings.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.options = SyncOptions::from_settings(settings);
        self.policy = settings.sync.retry_policy();
        self.excluded_query = Some(settings.sync.excluded_query.clone());
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// A manager for the account, or `None` when it may not sync.
    pub async fn manager_for(&self, account_id: &AccountId) -> Result<Option<SyncManager>> {
        let account = accounts::get_by_id(self.storage.db(), account_id)
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(account_id.clone()))?;
        if !account.can_sync() {
            return Ok(None);
        }

        let api = self.apis.api_for(&account)?;
        let mut connector =
            Connector::new(api, self.storage.db().clone(), account.id.clone()).with_policy(self.policy);
        if let Some(query) = &self.excluded_query {
            connector = connector.with_excluded_query(query.clone());
        }
        Ok(Some(SyncManager::new(
            self.storage.clone(),
            connector,
            self.queue.clone(),
            self.options.clone(),
        )))
    }
}

#[async_trait]
impl TaskHandler for ManagerFactory {
    async fn handle(&self, task: &SyncTask) -> Result<()> {
        let Some(manager) = self.manager_for(task.account_id()).await? else {
            tracing::info!(task = task.name(), account_id = %task.account_id(), "account cannot sync, dropping task");
            return Ok(());
        };

        match task {
            SyncTask::FullSynchronize { .. } => {
                manager.full_synchronize().await?;
            }
            SyncTask::SyncByHistory { .. } => {
                manager.sync_by_history().await?;
            }
            SyncTask::DownloadMessage { message_id, .. } => {
                manager.download_message(message_id).await?;
            }
            SyncTask::UpdateLabelsForMessage { message_id, .. } => {
                manager.update_labels_for_message(message_id).await?;
            }
            SyncTask::FirstSyncFinished { .. } => {
                manager.first_sync_finished().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::email::ProviderError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` runs, with a permanent error if asked.
    struct Flaky {
        failures: usize,
        permanent: bool,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize, permanent: bool) -> Arc<Self> {
            Arc::new(Self {
                failures,
                permanent,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, _task: &SyncTask) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.permanent {
                    SyncError::Provider(ProviderError::MailNotEnabled)
                } else {
                    SyncError::Provider(ProviderError::Connection("reset".into()))
                });
            }
            Ok(())
        }
    }

    /// Tracks how many runs overlap.
    #[derive(Default)]
    struct Slow {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _task: &SyncTask) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options(max_retries: u32, concurrency: usize) -> WorkerOptions {
        WorkerOptions {
            max_retries,
            retry_delay: Duration::from_secs(30),
            concurrency,
        }
    }

    fn full(account: &str) -> SyncTask {
        SyncTask::FullSynchronize {
            account_id: AccountId::from(account),
        }
    }

    #[test]
    fn tasks_serialize_with_a_tag() {
        let task = SyncTask::DownloadMessage {
            account_id: AccountId::from("acc"),
            message_id: EmailId::from("m1"),
        };
        assert_eq!(
            serde_json::to_value(&task).unwrap(),
            serde_json::json!({"task": "download_message", "account_id": "acc", "message_id": "m1"})
        );
        assert_eq!(task.name(), "download_message");
        assert_eq!(task.account_id().as_str(), "acc");
    }

    #[test]
    fn closed_queue_rejects_tasks() {
        let (queue, rx) = LocalTaskQueue::new();
        drop(rx);
        assert_eq!(queue.enqueue(full("acc")), Err(QueueError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let handler = Flaky::new(2, false);
        let worker = TaskWorker::new(handler.clone(), options(3, 1));
        let (queue, mut rx) = LocalTaskQueue::new();
        queue.enqueue(full("acc")).unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(worker.run_until_idle(&mut rx).await, 1);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        // 30s then 60s
        assert!(started.elapsed() >= Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let handler = Flaky::new(usize::MAX, false);
        let worker = TaskWorker::new(handler.clone(), options(2, 1));
        let (queue, mut rx) = LocalTaskQueue::new();
        queue.enqueue(full("acc")).unwrap();

        assert_eq!(worker.run_until_idle(&mut rx).await, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let handler = Flaky::new(usize::MAX, true);
        let worker = TaskWorker::new(handler.clone(), options(3, 1));
        let (queue, mut rx) = LocalTaskQueue::new();
        queue.enqueue(full("acc")).unwrap();

        assert_eq!(worker.run_until_idle(&mut rx).await, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_bounds_concurrency_and_drains() {
        let handler = Arc::new(Slow::default());
        let worker = TaskWorker::new(handler.clone(), options(0, 2));
        let (queue, rx) = LocalTaskQueue::new();
        for i in 0..6 {
            queue.enqueue(full(&format!("acc-{i}"))).unwrap();
        }
        drop(queue);

        worker.run(rx).await;

        assert_eq!(handler.done.load(Ordering::SeqCst), 6);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
    }

    async fn scheduler() -> (Scheduler, Database, TaskReceiver) {
        let db = Database::open_in_memory().await.unwrap();
        let (queue, rx) = LocalTaskQueue::new();
        (Scheduler::new(db.clone(), Arc::new(queue)), db, rx)
    }

    #[tokio::test]
    async fn new_accounts_get_a_full_sync_once() {
        let (scheduler, db, mut rx) = scheduler().await;
        accounts::insert(&db, &MailAccount::new("acc", "bob@example.com"))
            .await
            .unwrap();
        let id = AccountId::from("acc");

        assert_eq!(scheduler.schedule_sync(&id).await.unwrap(), ScheduleDecision::FullSync);
        assert_eq!(
            scheduler.schedule_sync(&id).await.unwrap(),
            ScheduleDecision::Skipped(SkipReason::AlreadySyncing)
        );
        assert_eq!(rx.try_recv(), Some(full("acc")));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn synced_accounts_get_incremental_runs() {
        let (scheduler, db, mut rx) = scheduler().await;
        let mut account = MailAccount::new("acc", "bob@example.com");
        account.history_id = Some(crate::domain::HistoryId(42));
        account.first_sync_finished_at = Some(chrono::Utc::now());
        accounts::insert(&db, &account).await.unwrap();
        accounts::insert(&db, &MailAccount::new("off", "off@example.com"))
            .await
            .unwrap();
        accounts::deauthorize(&db, &AccountId::from("off")).await.unwrap();

        let decisions = scheduler.schedule_all().await.unwrap();

        assert_eq!(
            decisions,
            vec![
                (AccountId::from("acc"), ScheduleDecision::Incremental),
                (AccountId::from("off"), ScheduleDecision::Skipped(SkipReason::Deauthorized)),
            ]
        );
        assert_eq!(
            rx.try_recv(),
            Some(SyncTask::SyncByHistory {
                account_id: AccountId::from("acc")
            })
        );
    }

    #[tokio::test]
    async fn unknown_accounts_are_reported() {
        let (scheduler, _db, _rx) = scheduler().await;
        let err = scheduler.schedule_sync(&AccountId::from("nope")).await.unwrap_err();
        assert!(matches!(err, SyncError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn deauthorized_accounts_drop_their_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayer::in_memory(dir.path()).await.unwrap();
        accounts::insert(storage.db(), &MailAccount::new("acc", "bob@example.com"))
            .await
            .unwrap();
        accounts::deauthorize(storage.db(), &AccountId::from("acc")).await.unwrap();

        let apis = |_: &MailAccount| -> Result<Arc<dyn GmailApi>> {
            Err(SyncError::Compose("no remote expected".into()))
        };
        let (queue, _rx) = LocalTaskQueue::new();
        let factory = ManagerFactory::new(storage, Arc::new(apis), Arc::new(queue));

        factory.handle(&full("acc")).await.unwrap();
    }
}
