use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::feed::{ParsedChannel, ParsedItem};
use crate::storage::{
    ChannelMeta, DatabaseError, Item, ItemArea, ItemState, ItemStore, ItemUpdate,
};
use crate::util::{discard_file, strip_control_chars};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync interrupted")]
    Interrupted,
    /// A second sync for a channel that is mid-update
    #[error("Channel {0} is already being updated")]
    AlreadyUpdating(i64),
    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

/// What a successful sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    /// Items whose id and state were carried over by title
    pub kept: usize,
    /// Ids of stored items absent from the new feed
    pub removed: Vec<i64>,
    /// Deferred writes applied after the swap
    pub replayed: usize,
}

/// Result of a single-item write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The channel is mid-sync; the write runs after the swap.
    Deferred,
    /// No live item has that id.
    Missing,
}

#[derive(Default)]
struct ChannelGuard {
    updating: bool,
    pending: VecDeque<(i64, ItemUpdate)>,
    /// Direct writes in flight against the live table
    writers: usize,
}

impl ChannelGuard {
    fn is_idle(&self) -> bool {
        !self.updating && self.writers == 0 && self.pending.is_empty()
    }
}

/// Replaces a channel's stored items with a freshly parsed set.
///
/// The new set is built in the staging table and swapped in with one
/// commit, so readers never see a half-written channel. Item writes that
/// arrive mid-sync are queued and replayed against the new set.
pub struct Reconciler<S> {
    store: Arc<S>,
    download_dir: Option<PathBuf>,
    channels: Mutex<HashMap<i64, ChannelGuard>>,
    writers_drained: Notify,
}

impl<S: ItemStore> Reconciler<S> {
    pub fn new(store: Arc<S>, download_dir: Option<PathBuf>) -> Self {
        Self {
            store,
            download_dir,
            channels: Mutex::new(HashMap::new()),
            writers_drained: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether a sync for `channel_id` is between mark and unmark.
    pub fn is_updating(&self, channel_id: i64) -> bool {
        self.lock()
            .get(&channel_id)
            .is_some_and(|guard| guard.updating)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, ChannelGuard>> {
        // The map stays consistent even if a holder panicked: every
        // critical section is a handful of field updates.
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn sync_channel_items(
        &self,
        channel_id: i64,
        parsed: &ParsedChannel,
        icon: Option<Vec<u8>>,
        token: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        {
            let mut channels = self.lock();
            let guard = channels.entry(channel_id).or_default();
            if guard.updating {
                return Err(SyncError::AlreadyUpdating(channel_id));
            }
            guard.updating = true;
        }
        let mut mark = UpdateMark {
            reconciler: self,
            channel_id,
            armed: true,
        };

        self.wait_for_writers(channel_id).await;

        let (mut report, cached) = self.stage_and_commit(channel_id, parsed, icon, token).await?;

        report.replayed = self.replay_pending(channel_id).await;
        mark.armed = false;

        self.remove_cached_files(&cached).await;
        tracing::info!(
            channel_id,
            added = report.added,
            kept = report.kept,
            removed = report.removed.len(),
            replayed = report.replayed,
            "Channel items synced"
        );
        Ok(report)
    }

    /// Block until direct writes that started before the mark have finished.
    async fn wait_for_writers(&self, channel_id: i64) {
        loop {
            // Registered before the check so a release in between is not lost.
            let drained = self.writers_drained.notified();
            let writers = self.lock().get(&channel_id).map_or(0, |g| g.writers);
            if writers == 0 {
                return;
            }
            drained.await;
        }
    }

    async fn stage_and_commit(
        &self,
        channel_id: i64,
        parsed: &ParsedChannel,
        icon: Option<Vec<u8>>,
        token: &CancellationToken,
    ) -> Result<(SyncReport, Vec<i64>), SyncError> {
        if self.store.query_channel(channel_id).await?.is_none() {
            return Err(DatabaseError::ChannelNotFound(channel_id).into());
        }

        self.store.drop_staging_area(channel_id).await?;
        self.store.create_staging_area(channel_id).await?;

        match self.fill_staging(channel_id, parsed, icon, token).await {
            Ok(done) => Ok(done),
            Err(e) => {
                if let Err(drop_err) = self.store.drop_staging_area(channel_id).await {
                    tracing::warn!(channel_id, error = %drop_err, "Failed to drop staging area");
                }
                Err(e)
            }
        }
    }

    async fn fill_staging(
        &self,
        channel_id: i64,
        parsed: &ParsedChannel,
        icon: Option<Vec<u8>>,
        token: &CancellationToken,
    ) -> Result<(SyncReport, Vec<i64>), SyncError> {
        let mut stored = self.store.query_items(channel_id).await?;
        stored.sort_by_key(|item| item.id);

        let (mut merged, removed, added) = {
            let mut by_title: HashMap<&str, VecDeque<&Item>> = HashMap::new();
            for item in &stored {
                by_title.entry(item.title.as_str()).or_default().push_back(item);
            }

            let mut merged: Vec<Item> = parsed
                .items
                .iter()
                .map(|p| to_item(channel_id, p))
                .collect();
            let mut added = 0;
            for item in &mut merged {
                match by_title.get_mut(item.title.as_str()).and_then(VecDeque::pop_front) {
                    Some(previous) => {
                        item.id = previous.id;
                        item.state = previous.state;
                        item.downloaded = previous.downloaded;
                    }
                    None => added += 1,
                }
            }

            let mut removed: Vec<&Item> = by_title.into_values().flatten().collect();
            removed.sort_by_key(|item| item.id);
            let removed: Vec<(i64, bool)> = removed.iter().map(|i| (i.id, i.downloaded)).collect();
            (merged, removed, added)
        };

        if added > 0 {
            let mut next_id = self.store.allocate_item_ids(added).await?;
            for item in merged.iter_mut().filter(|i| i.id == 0) {
                item.id = next_id;
                next_id += 1;
            }
        }

        for (position, item) in merged.iter().enumerate() {
            if token.is_cancelled() {
                tracing::debug!(channel_id, position, "Sync cancelled while staging");
                return Err(SyncError::Interrupted);
            }
            self.store
                .insert_into(ItemArea::Staging(channel_id), item, position as i64)
                .await?;
        }

        if token.is_cancelled() {
            return Err(SyncError::Interrupted);
        }

        let meta = ChannelMeta {
            title: strip_control_chars(&parsed.title).trim().to_string(),
            description: parsed.description.clone(),
            image: icon,
            last_update: chrono::Utc::now().timestamp(),
        };
        self.store.commit_staging(channel_id, &meta).await?;

        let cached = removed
            .iter()
            .filter(|(_, downloaded)| *downloaded)
            .map(|(id, _)| *id)
            .collect();
        let report = SyncReport {
            added,
            kept: merged.len() - added,
            removed: removed.into_iter().map(|(id, _)| id).collect(),
            replayed: 0,
        };
        Ok((report, cached))
    }

    /// Apply queued writes until the queue stays empty, then unmark.
    async fn replay_pending(&self, channel_id: i64) -> usize {
        let mut replayed = 0;
        loop {
            let batch: Vec<(i64, ItemUpdate)> = {
                let mut channels = self.lock();
                let Some(guard) = channels.get_mut(&channel_id) else {
                    return replayed;
                };
                if guard.pending.is_empty() {
                    guard.updating = false;
                    if guard.is_idle() {
                        channels.remove(&channel_id);
                    }
                    return replayed;
                }
                guard.pending.drain(..).collect()
            };

            for (item_id, update) in batch {
                match self.apply(channel_id, item_id, update).await {
                    Ok(true) => replayed += 1,
                    Ok(false) => {
                        tracing::debug!(channel_id, item_id, "Deferred write dropped, item no longer exists");
                    }
                    Err(e) => {
                        tracing::warn!(channel_id, item_id, error = %e, "Deferred write failed");
                    }
                }
            }
        }
    }

    async fn apply(
        &self,
        channel_id: i64,
        item_id: i64,
        update: ItemUpdate,
    ) -> Result<bool, DatabaseError> {
        match update {
            ItemUpdate::State(state) => {
                self.store.update_item_state(channel_id, item_id, state).await
            }
            ItemUpdate::Downloaded(downloaded) => {
                self.store
                    .update_item_downloaded(channel_id, item_id, downloaded)
                    .await
            }
        }
    }

    async fn remove_cached_files(&self, removed: &[i64]) {
        let Some(dir) = &self.download_dir else { return };
        for id in removed {
            let path = dir.join(id.to_string());
            if discard_file(&path).await {
                tracing::debug!(path = %path.display(), "Removed cached enclosure");
            }
        }
    }

    pub async fn set_item_state(
        &self,
        channel_id: i64,
        item_id: i64,
        state: ItemState,
    ) -> Result<WriteOutcome, DatabaseError> {
        self.write(channel_id, item_id, ItemUpdate::State(state)).await
    }

    pub async fn set_item_downloaded(
        &self,
        channel_id: i64,
        item_id: i64,
        downloaded: bool,
    ) -> Result<WriteOutcome, DatabaseError> {
        self.write(channel_id, item_id, ItemUpdate::Downloaded(downloaded))
            .await
    }

    async fn write(
        &self,
        channel_id: i64,
        item_id: i64,
        update: ItemUpdate,
    ) -> Result<WriteOutcome, DatabaseError> {
        let _permit = {
            let mut channels = self.lock();
            let guard = channels.entry(channel_id).or_default();
            if guard.updating {
                guard.pending.push_back((item_id, update));
                tracing::debug!(channel_id, item_id, "Channel is updating, write deferred");
                return Ok(WriteOutcome::Deferred);
            }
            guard.writers += 1;
            WriterPermit {
                reconciler: self,
                channel_id,
            }
        };

        if self.apply(channel_id, item_id, update).await? {
            Ok(WriteOutcome::Applied)
        } else {
            Ok(WriteOutcome::Missing)
        }
    }
}

fn to_item(channel_id: i64, parsed: &ParsedItem) -> Item {
    Item {
        id: 0,
        channel_id,
        title: strip_control_chars(&parsed.title).trim().to_string(),
        description: parsed.description.clone(),
        link: parsed.link.clone(),
        enclosure_url: parsed.enclosure_url.clone(),
        enclosure_length: parsed.enclosure_length,
        enclosure_type: parsed.enclosure_type.clone(),
        pub_date: parsed.pub_date.clone(),
        state: ItemState::New,
        downloaded: false,
    }
}

/// Clears the "under update" mark if a sync exits early, discarding the
/// writes queued behind it.
struct UpdateMark<'a, S> {
    reconciler: &'a Reconciler<S>,
    channel_id: i64,
    armed: bool,
}

impl<S> Drop for UpdateMark<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut channels = self
            .reconciler
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(guard) = channels.get_mut(&self.channel_id) {
            if !guard.pending.is_empty() {
                tracing::debug!(
                    channel_id = self.channel_id,
                    discarded = guard.pending.len(),
                    "Sync failed, discarding deferred writes"
                );
            }
            guard.pending.clear();
            guard.updating = false;
            if guard.is_idle() {
                channels.remove(&self.channel_id);
            }
        }
    }
}

struct WriterPermit<'a, S> {
    reconciler: &'a Reconciler<S>,
    channel_id: i64,
}

impl<S> Drop for WriterPermit<'_, S> {
    fn drop(&mut self) {
        let mut channels = self
            .reconciler
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(guard) = channels.get_mut(&self.channel_id) {
            guard.writers = guard.writers.saturating_sub(1);
            if guard.writers == 0 {
                if guard.is_idle() {
                    channels.remove(&self.channel_id);
                }
                self.reconciler.writers_drained.notify_waiters();
            }
        }
    }
}
