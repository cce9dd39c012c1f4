use anyhow::{bail, Result};

use super::schema::{item_table_ddl, Database};
use super::types::{Channel, ChannelDbRow, ChannelPrefs, ItemArea, DEFAULT_CATEGORY_ID};
use crate::util::strip_control_chars;

impl Database {
    // ========================================================================
    // Channel Operations
    // ========================================================================

    /// Add a channel and create its empty live item table, returning the id.
    ///
    /// Subscribing to a URL that already exists returns the existing id.
    /// The title is a placeholder until the first sync replaces it.
    pub async fn subscribe_channel(
        &self,
        url: &str,
        title: &str,
        category_id: Option<i64>,
    ) -> Result<i64> {
        let title = strip_control_chars(title);
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM channels WHERE url = ?")
            .bind(url)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO channels (url, title, category_id) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(url)
        .bind(title.trim())
        .bind(category_id.unwrap_or(DEFAULT_CATEGORY_ID))
        .fetch_one(&mut *tx)
        .await?;

        let ddl = item_table_ddl(&ItemArea::Live(row.0).table_name());
        sqlx::query(&ddl).persistent(false).execute(&mut *tx).await?;

        tx.commit().await?;
        tracing::info!(channel_id = row.0, url = %url, "Subscribed channel");
        Ok(row.0)
    }

    /// Delete a channel with both of its item tables.
    ///
    /// Returns `false` if the channel did not exist.
    pub async fn unsubscribe_channel(&self, channel_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for area in [ItemArea::Live(channel_id), ItemArea::Staging(channel_id)] {
            let sql = format!("DROP TABLE IF EXISTS {}", area.table_name());
            sqlx::query(&sql).persistent(false).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// All channels ordered by title.
    pub async fn get_channels(&self) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelDbRow> = sqlx::query_as(
            "SELECT id, url, title, description, image, action, item_order, last_update, \
             category_id FROM channels ORDER BY title COLLATE NOCASE, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ChannelDbRow::into_channel).collect())
    }

    pub async fn channel_id_by_url(&self, url: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM channels WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    /// Change how items open, their order and the category of a channel.
    pub async fn set_channel_prefs(&self, channel_id: i64, prefs: ChannelPrefs) -> Result<()> {
        let result = sqlx::query(
            "UPDATE channels SET action = ?, item_order = ?, category_id = ? WHERE id = ?",
        )
        .bind(prefs.action.to_db())
        .bind(prefs.order.to_db())
        .bind(prefs.category_id.unwrap_or(DEFAULT_CATEGORY_ID))
        .bind(channel_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("Channel {} not found", channel_id);
        }
        Ok(())
    }

    /// Item count and count of `New` items, per live table.
    pub async fn item_counts(&self, channel_id: i64) -> Result<(i64, i64)> {
        let sql = format!(
            "SELECT COUNT(*), COUNT(CASE WHEN state = 0 THEN 1 END) FROM {}",
            ItemArea::Live(channel_id).table_name()
        );
        let row: (i64, i64) = sqlx::query_as(&sql)
            .persistent(false)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }
}
