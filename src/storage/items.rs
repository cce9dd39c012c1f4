use super::schema::Database;
use super::types::{DatabaseError, Item, ItemArea, ItemDbRow};

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Look up one live item of a channel.
    pub async fn find_item(
        &self,
        channel_id: i64,
        item_id: i64,
    ) -> Result<Option<Item>, DatabaseError> {
        let sql = format!(
            "SELECT id, title, description, link, enclosure_url, enclosure_length, \
             enclosure_type, pub_date, state, downloaded FROM {} WHERE id = ?",
            ItemArea::Live(channel_id).table_name()
        );
        let row: Option<ItemDbRow> = sqlx::query_as(&sql)
            .persistent(false)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(|r| r.into_item(channel_id)))
    }
}
