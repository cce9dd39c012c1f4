use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::AppContext;
use crate::feed::opml;
use crate::net::LoadError;
use crate::storage::{
    Category, Channel, ChannelPrefs, Database, DatabaseError, Item, ItemOrder, ItemState,
    ItemStore,
};
use crate::sync::{ChannelUpdateJob, ItemDownloadJob, WriteOutcome};
use crate::task::{
    AdmissionError, BgTask, Job, ListenerKey, TaskEvent, TaskKey, TaskOutcome, TaskRegistry,
    TaskState,
};
use crate::util::{discard_file, validate_feed_url};

/// Result of an OPML import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    /// Outlines whose URL was already subscribed
    pub existing: usize,
}

/// Entry point for callers: requests background work, reports its state
/// and manages channels.
pub struct SyncEngine {
    ctx: Arc<AppContext>,
    registry: TaskRegistry,
    shutdown: CancellationToken,
}

impl SyncEngine {
    pub fn new(db: Database, config: Config) -> Result<Self, LoadError> {
        let registry = TaskRegistry::new(config.max_concurrent_tasks);
        Ok(Self {
            ctx: Arc::new(AppContext::new(db, config)?),
            registry,
            shutdown: CancellationToken::new(),
        })
    }

    /// Open (or create) the database at `db_path` and build an engine on it.
    pub async fn open(db_path: &str, config: Config) -> Result<Self> {
        let db = Database::open(db_path)
            .await
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        Ok(Self::new(db, config)?)
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Start a sync of `channel_id` unless one is already registered.
    pub fn request_channel_update(&self, channel_id: i64) -> Result<(), AdmissionError> {
        let job = ChannelUpdateJob::new(Arc::clone(&self.ctx), channel_id);
        self.spawn(TaskKey::update(channel_id), Arc::new(job))
    }

    /// Start downloading the enclosure of `item_id`.
    pub fn request_item_download(
        &self,
        channel_id: i64,
        item_id: i64,
    ) -> Result<(), AdmissionError> {
        let job = ItemDownloadJob::new(Arc::clone(&self.ctx), channel_id, item_id);
        self.spawn(TaskKey::download(item_id), Arc::new(job))
    }

    fn spawn(&self, key: TaskKey, job: Arc<dyn Job>) -> Result<(), AdmissionError> {
        let task = BgTask::new(job, self.shutdown.child_token());
        if let Err(e) = self.registry.try_register(key, Arc::clone(&task)) {
            tracing::debug!(key = %key, reason = %e, "Task request refused");
            return Err(e);
        }
        task.start();
        Ok(())
    }

    /// See [`TaskRegistry::state`] for the read-once semantics of `Failed`.
    pub fn update_state(&self, channel_id: i64) -> TaskState {
        self.registry.state(TaskKey::update(channel_id))
    }

    pub fn download_state(&self, item_id: i64) -> TaskState {
        self.registry.state(TaskKey::download(item_id))
    }

    pub fn cancel(&self, key: TaskKey) -> bool {
        self.registry.cancel(key)
    }

    pub fn consume(&self, key: TaskKey) -> bool {
        self.registry.consume(key)
    }

    /// Receive the events of the task under `key`; `None` when no task is
    /// registered.
    pub fn subscribe(
        &self,
        key: TaskKey,
        listener: ListenerKey,
    ) -> Option<mpsc::UnboundedReceiver<TaskEvent>> {
        self.registry.bind(key, listener).map(|(_, rx)| rx)
    }

    pub fn unsubscribe(&self, key: TaskKey, listener: ListenerKey) -> bool {
        self.registry
            .get(key)
            .is_some_and(|task| task.remove_listener(listener))
    }

    /// Wait for the task under `key` to finish. The entry stays registered.
    pub async fn wait(&self, key: TaskKey) -> Option<TaskOutcome> {
        let task = self.registry.get(key)?;
        Some(task.wait().await)
    }

    /// Cancel every task and wait for all of them to return.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for task in self.registry.live_tasks() {
            task.wait().await;
        }
        tracing::info!("Sync engine stopped");
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Set an item's reading state; deferred while its channel syncs.
    pub async fn set_item_state(
        &self,
        channel_id: i64,
        item_id: i64,
        state: ItemState,
    ) -> Result<WriteOutcome, DatabaseError> {
        self.ctx
            .reconciler
            .set_item_state(channel_id, item_id, state)
            .await
    }

    /// Items of a channel in the channel's preferred order.
    pub async fn items(&self, channel_id: i64) -> Result<Vec<Item>> {
        let channel = self
            .ctx
            .db
            .query_channel(channel_id)
            .await?
            .with_context(|| format!("Channel {} not found", channel_id))?;
        let mut items = self.ctx.db.query_items(channel_id).await?;
        if channel.order == ItemOrder::Oldest {
            items.reverse();
        }
        Ok(items)
    }

    // ========================================================================
    // Channels and categories
    // ========================================================================

    pub async fn channels(&self) -> Result<Vec<Channel>> {
        self.ctx.db.get_channels().await
    }

    /// Subscribe to a feed URL. The URL doubles as title until the first
    /// update.
    pub async fn subscribe_channel(&self, url: &str, category_id: Option<i64>) -> Result<i64> {
        let url = validate_feed_url(url, self.ctx.config.allow_private_hosts)
            .with_context(|| format!("Refusing to subscribe to {}", url))?;
        self.ctx
            .db
            .subscribe_channel(url.as_str(), url.as_str(), category_id)
            .await
    }

    /// Remove a channel, its items and their downloaded files. The
    /// channel's running update and item downloads are cancelled first.
    pub async fn unsubscribe_channel(&self, channel_id: i64) -> Result<bool> {
        self.stop_task(TaskKey::update(channel_id)).await;
        for item in self.channel_items(channel_id).await {
            self.stop_task(TaskKey::download(item.id)).await;
        }

        // Read again: a download may have completed before its cancel landed.
        let downloaded: Vec<i64> = self
            .channel_items(channel_id)
            .await
            .iter()
            .filter(|i| i.downloaded)
            .map(|i| i.id)
            .collect();

        let removed = self.ctx.db.unsubscribe_channel(channel_id).await?;
        if let Some(dir) = &self.ctx.config.download_dir {
            for id in downloaded {
                discard_file(&dir.join(id.to_string())).await;
            }
        }
        Ok(removed)
    }

    /// Cancel the task under `key`, wait for it and drop its entry.
    async fn stop_task(&self, key: TaskKey) {
        if let Some(task) = self.registry.get(key) {
            task.cancel();
            task.wait().await;
            self.registry.unregister(key);
        }
    }

    async fn channel_items(&self, channel_id: i64) -> Vec<Item> {
        match self.ctx.db.query_items(channel_id).await {
            Ok(items) => items,
            Err(e) => {
                tracing::debug!(channel_id, error = %e, "No items to clean up");
                Vec::new()
            }
        }
    }

    pub async fn set_channel_prefs(&self, channel_id: i64, prefs: ChannelPrefs) -> Result<()> {
        self.ctx.db.set_channel_prefs(channel_id, prefs).await
    }

    pub async fn categories(&self) -> Result<Vec<Category>> {
        self.ctx.db.get_categories().await
    }

    pub async fn create_category(&self, name: &str) -> Result<i64> {
        self.ctx.db.create_category(name).await
    }

    pub async fn rename_category(&self, id: i64, name: &str) -> Result<()> {
        self.ctx.db.rename_category(id, name).await
    }

    pub async fn delete_category(&self, id: i64) -> Result<()> {
        self.ctx.db.delete_category(id).await
    }

    /// Subscribe to every feed of an OPML file, creating folder categories
    /// as needed.
    pub async fn import_opml(&self, path: &str) -> Result<ImportSummary> {
        let outlines = opml::parse(path, self.ctx.config.allow_private_hosts).await?;
        let mut summary = ImportSummary::default();

        for outline in outlines {
            // Same normalization as `subscribe_channel`, so duplicates match.
            let url = validate_feed_url(&outline.xml_url, self.ctx.config.allow_private_hosts)?;
            if self.ctx.db.channel_id_by_url(url.as_str()).await?.is_some() {
                summary.existing += 1;
                continue;
            }
            let category_id = match &outline.category {
                Some(name) => Some(self.ctx.db.ensure_category(name).await?),
                None => None,
            };
            self.ctx
                .db
                .subscribe_channel(url.as_str(), &outline.title, category_id)
                .await?;
            summary.added += 1;
        }

        tracing::info!(
            path = %path,
            added = summary.added,
            existing = summary.existing,
            "OPML import complete"
        );
        Ok(summary)
    }
}
