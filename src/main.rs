//! mailmirror-worker - runs synchronization for every configured account

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use mailmirror::config::Settings;
use mailmirror::domain::{AccountId, MailAccount};
use mailmirror::providers::email::{GmailApi, HttpGmailApi, OAuthTokenSource};
use mailmirror::services::{
    ApiFactory, LocalTaskQueue, ManagerFactory, Scheduler, SyncError, TaskWorker, WorkerOptions,
};
use mailmirror::storage::queries::accounts;
use mailmirror::storage::{KeychainAccess, SecretStore, StorageLayer};

/// HTTP clients per account, kept so access tokens survive across tasks.
struct HttpApis {
    client: reqwest::Client,
    settings: Settings,
    secrets: Arc<dyn SecretStore>,
    cache: Mutex<HashMap<AccountId, Arc<dyn GmailApi>>>,
}

impl ApiFactory for HttpApis {
    fn api_for(&self, account: &MailAccount) -> Result<Arc<dyn GmailApi>, SyncError> {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let api = cache.entry(account.id.clone()).or_insert_with(|| {
            let tokens = OAuthTokenSource::new(
                self.client.clone(),
                self.settings.gmail.token_url.clone(),
                self.settings.gmail.client_id.clone(),
                account.id.clone(),
                self.secrets.clone(),
            );
            let api: Arc<dyn GmailApi> = Arc::new(HttpGmailApi::new(
                self.client.clone(),
                self.settings.gmail.api_base.clone(),
                self.settings.gmail.list_page_size,
                Arc::new(tokens),
            ));
            api
        });
        Ok(api.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting mailmirror worker");

    let storage = StorageLayer::open(settings.database_path()?, settings.attachments_dir()?)
        .await
        .context("opening local mirror")?;
    let stale = accounts::clear_syncing(storage.db()).await?;
    if stale > 0 {
        tracing::info!(accounts = stale, "cleared syncing flags left by a previous run");
    }

    let apis = HttpApis {
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building HTTP client")?,
        settings: settings.clone(),
        secrets: Arc::new(KeychainAccess::new()),
        cache: Mutex::new(HashMap::new()),
    };

    let (queue, rx) = LocalTaskQueue::new();
    let queue = Arc::new(queue);
    let handler = ManagerFactory::new(storage.clone(), Arc::new(apis), queue.clone())
        .with_settings(&settings);
    let worker = TaskWorker::new(Arc::new(handler), WorkerOptions::from_settings(&settings.tasks));
    let scheduler = Scheduler::new(storage.db().clone(), queue);

    let worker_task = tokio::spawn(async move { worker.run(rx).await });

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.tasks.poll_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match scheduler.schedule_all().await {
                    Ok(decisions) => tracing::debug!(accounts = decisions.len(), "scheduler pass"),
                    Err(e) => tracing::error!(error = %e, "scheduler pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    worker_task.abort();
    let cleared = accounts::clear_syncing(storage.db()).await?;
    tracing::info!(accounts = cleared, "stopped");
    Ok(())
}
