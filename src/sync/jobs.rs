use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::context::AppContext;
use crate::error::JobError;
use crate::feed;
use crate::net::LoadError;
use crate::storage::ItemStore;
use crate::sync::WriteOutcome;
use crate::task::{Job, TaskContext};
use crate::util::discard_file;

/// Fetch, parse and reconcile one channel.
pub struct ChannelUpdateJob {
    ctx: Arc<AppContext>,
    channel_id: i64,
}

impl ChannelUpdateJob {
    pub fn new(ctx: Arc<AppContext>, channel_id: i64) -> Self {
        Self { ctx, channel_id }
    }

    /// The icon is optional: transport failures leave the stored one in
    /// place. Cancellation still aborts the whole update.
    async fn fetch_icon(
        &self,
        channel_url: &str,
        image_url: &str,
        task: &TaskContext,
    ) -> Result<Option<Vec<u8>>, JobError> {
        let resolved = match Url::parse(channel_url).and_then(|base| base.join(image_url)) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(channel_id = self.channel_id, image_url = %image_url, error = %e, "Invalid icon URL");
                return Ok(None);
            }
        };

        match self
            .ctx
            .loader
            .fetch(resolved.as_str(), task.token(), |_, _| {})
            .await
        {
            Ok(bytes) => Ok(Some(bytes)),
            Err(LoadError::Cancelled) => Err(LoadError::Cancelled.into()),
            Err(e) => {
                tracing::warn!(channel_id = self.channel_id, url = %resolved, error = %e, "Icon fetch failed, keeping previous icon");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Job for ChannelUpdateJob {
    fn name(&self) -> String {
        format!("update channel {}", self.channel_id)
    }

    async fn run(&self, task: &TaskContext) -> Result<(), JobError> {
        let channel = self
            .ctx
            .db
            .query_channel(self.channel_id)
            .await?
            .ok_or(JobError::ChannelNotFound(self.channel_id))?;

        let bytes = self
            .ctx
            .loader
            .fetch(&channel.url, task.token(), |done, total| {
                task.progress(done, total)
            })
            .await?;

        let parsed = feed::parse(&bytes, task.token())?;
        tracing::debug!(
            channel_id = self.channel_id,
            items = parsed.items.len(),
            "Parsed channel"
        );

        let icon = match parsed.image_url.as_deref() {
            Some(image_url) => self.fetch_icon(&channel.url, image_url, task).await?,
            None => None,
        };

        self.ctx
            .reconciler
            .sync_channel_items(self.channel_id, &parsed, icon, task.token())
            .await?;
        Ok(())
    }
}

/// Save one item's enclosure (or link) as `<download_dir>/<item id>`.
pub struct ItemDownloadJob {
    ctx: Arc<AppContext>,
    channel_id: i64,
    item_id: i64,
}

impl ItemDownloadJob {
    pub fn new(ctx: Arc<AppContext>, channel_id: i64, item_id: i64) -> Self {
        Self {
            ctx,
            channel_id,
            item_id,
        }
    }
}

#[async_trait]
impl Job for ItemDownloadJob {
    fn name(&self) -> String {
        format!("download item {}", self.item_id)
    }

    async fn run(&self, task: &TaskContext) -> Result<(), JobError> {
        let dir = self
            .ctx
            .config
            .download_dir
            .as_deref()
            .ok_or(JobError::DownloadsDisabled)?;

        let channel = self
            .ctx
            .db
            .query_channel(self.channel_id)
            .await?
            .ok_or(JobError::ChannelNotFound(self.channel_id))?;
        let item = self
            .ctx
            .db
            .find_item(self.channel_id, self.item_id)
            .await?
            .ok_or(JobError::ItemNotFound {
                channel_id: self.channel_id,
                item_id: self.item_id,
            })?;

        let url = if channel.action.targets_enclosure() {
            item.enclosure_url.or(item.link)
        } else {
            item.link.or(item.enclosure_url)
        }
        .ok_or(JobError::NothingToDownload(self.item_id))?;

        tokio::fs::create_dir_all(dir).await?;
        let dest = dir.join(self.item_id.to_string());
        let written = self
            .ctx
            .loader
            .download_to(&url, &dest, task.token(), |done, total| {
                task.progress(done, total)
            })
            .await?;

        // An unmarked file would never be cleaned up, so it goes whenever
        // the item cannot be flagged.
        let outcome = match self
            .ctx
            .reconciler
            .set_item_downloaded(self.channel_id, self.item_id, true)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                discard_file(&dest).await;
                return Err(e.into());
            }
        };
        if outcome == WriteOutcome::Missing {
            // The item disappeared in a sync while we were downloading.
            discard_file(&dest).await;
            return Err(JobError::ItemNotFound {
                channel_id: self.channel_id,
                item_id: self.item_id,
            });
        }

        tracing::info!(item_id = self.item_id, bytes = written, "Item downloaded");
        Ok(())
    }
}
