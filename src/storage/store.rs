use async_trait::async_trait;

use super::schema::{item_table_ddl, Database};
use super::types::{
    Channel, ChannelDbRow, ChannelMeta, DatabaseError, Item, ItemArea, ItemDbRow, ItemState,
};

/// Storage contract the reconciler runs against.
///
/// Every channel owns a live item table and, while a sync runs, a staging
/// table of the same shape (see [`ItemArea`]). `commit_staging` must make
/// the staged set visible atomically: a reader sees either the old or the
/// new items, never a mix.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Create an empty staging table. Fails if one already exists.
    async fn create_staging_area(&self, channel_id: i64) -> Result<(), DatabaseError>;

    /// Drop the staging table if present.
    async fn drop_staging_area(&self, channel_id: i64) -> Result<(), DatabaseError>;

    /// Insert `item` at display `position` (0 = first in feed order).
    async fn insert_into(
        &self,
        area: ItemArea,
        item: &Item,
        position: i64,
    ) -> Result<(), DatabaseError>;

    /// Replace the live table with the staging table and write `meta`, in
    /// one transaction.
    async fn commit_staging(&self, channel_id: i64, meta: &ChannelMeta)
        -> Result<(), DatabaseError>;

    /// Live items in display position order.
    async fn query_items(&self, channel_id: i64) -> Result<Vec<Item>, DatabaseError>;

    async fn query_channel(&self, channel_id: i64) -> Result<Option<Channel>, DatabaseError>;

    /// Returns `false` when no live row has `item_id`.
    async fn update_item_state(
        &self,
        channel_id: i64,
        item_id: i64,
        state: ItemState,
    ) -> Result<bool, DatabaseError>;

    /// Returns `false` when no live row has `item_id`.
    async fn update_item_downloaded(
        &self,
        channel_id: i64,
        item_id: i64,
        downloaded: bool,
    ) -> Result<bool, DatabaseError>;

    async fn update_channel_meta(
        &self,
        channel_id: i64,
        meta: &ChannelMeta,
    ) -> Result<(), DatabaseError>;

    /// Reserve `count` consecutive item ids and return the first one.
    async fn allocate_item_ids(&self, count: usize) -> Result<i64, DatabaseError>;
}

// Table names are built from integer ids only, so formatting them into SQL
// is safe. Statements against per-channel tables are not cached: the table
// set changes on every swap.
#[async_trait]
impl ItemStore for Database {
    async fn create_staging_area(&self, channel_id: i64) -> Result<(), DatabaseError> {
        let table = ItemArea::Staging(channel_id).table_name();
        let ddl = item_table_ddl(&table).replace("IF NOT EXISTS ", "");
        sqlx::query(&ddl)
            .persistent(false)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn drop_staging_area(&self, channel_id: i64) -> Result<(), DatabaseError> {
        let sql = format!(
            "DROP TABLE IF EXISTS {}",
            ItemArea::Staging(channel_id).table_name()
        );
        sqlx::query(&sql)
            .persistent(false)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn insert_into(
        &self,
        area: ItemArea,
        item: &Item,
        position: i64,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO {} (id, title, description, link, enclosure_url, enclosure_length, \
             enclosure_type, pub_date, state, downloaded, position) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            area.table_name()
        );
        sqlx::query(&sql)
            .persistent(false)
            .bind(item.id)
            .bind(&item.title)
            .bind(&item.description)
            .bind(&item.link)
            .bind(&item.enclosure_url)
            .bind(item.enclosure_length)
            .bind(&item.enclosure_type)
            .bind(&item.pub_date)
            .bind(item.state.to_db())
            .bind(item.downloaded)
            .bind(position)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn commit_staging(
        &self,
        channel_id: i64,
        meta: &ChannelMeta,
    ) -> Result<(), DatabaseError> {
        let live = ItemArea::Live(channel_id).table_name();
        let staging = ItemArea::Staging(channel_id).table_name();

        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let drop_live = format!("DROP TABLE IF EXISTS {live}");
        sqlx::query(&drop_live)
            .persistent(false)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let rename = format!("ALTER TABLE {staging} RENAME TO {live}");
        sqlx::query(&rename)
            .persistent(false)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let updated = write_channel_meta(&mut *tx, channel_id, meta).await?;
        if !updated {
            // Dropping `tx` rolls the swap back.
            return Err(DatabaseError::ChannelNotFound(channel_id));
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn query_items(&self, channel_id: i64) -> Result<Vec<Item>, DatabaseError> {
        let sql = format!(
            "SELECT id, title, description, link, enclosure_url, enclosure_length, \
             enclosure_type, pub_date, state, downloaded FROM {} ORDER BY position",
            ItemArea::Live(channel_id).table_name()
        );
        let rows: Vec<ItemDbRow> = sqlx::query_as(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| row.into_item(channel_id))
            .collect())
    }

    async fn query_channel(&self, channel_id: i64) -> Result<Option<Channel>, DatabaseError> {
        let row: Option<ChannelDbRow> = sqlx::query_as(
            "SELECT id, url, title, description, image, action, item_order, last_update, \
             category_id FROM channels WHERE id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(ChannelDbRow::into_channel))
    }

    async fn update_item_state(
        &self,
        channel_id: i64,
        item_id: i64,
        state: ItemState,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "UPDATE {} SET state = ? WHERE id = ?",
            ItemArea::Live(channel_id).table_name()
        );
        let result = sqlx::query(&sql)
            .persistent(false)
            .bind(state.to_db())
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_item_downloaded(
        &self,
        channel_id: i64,
        item_id: i64,
        downloaded: bool,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "UPDATE {} SET downloaded = ? WHERE id = ?",
            ItemArea::Live(channel_id).table_name()
        );
        let result = sqlx::query(&sql)
            .persistent(false)
            .bind(downloaded)
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_channel_meta(
        &self,
        channel_id: i64,
        meta: &ChannelMeta,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        if write_channel_meta(&mut *conn, channel_id, meta).await? {
            Ok(())
        } else {
            Err(DatabaseError::ChannelNotFound(channel_id))
        }
    }

    async fn allocate_item_ids(&self, count: usize) -> Result<i64, DatabaseError> {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let row: (i64,) = sqlx::query_as(
            "UPDATE meta SET value = value + ? WHERE key = 'next_item_id' RETURNING value - ?",
        )
        .bind(count)
        .bind(count)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(row.0)
    }
}

/// `COALESCE` keeps the stored icon when the sync brought none.
async fn write_channel_meta(
    conn: &mut sqlx::SqliteConnection,
    channel_id: i64,
    meta: &ChannelMeta,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE channels SET title = ?, description = ?, image = COALESCE(?, image), \
         last_update = ? WHERE id = ?",
    )
    .bind(&meta.title)
    .bind(&meta.description)
    .bind(&meta.image)
    .bind(meta.last_update)
    .bind(channel_id)
    .execute(conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_db() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let id = db
            .subscribe_channel("https://example.com/feed", "Example", None)
            .await
            .unwrap();
        (db, id)
    }

    fn item(id: i64, title: &str) -> Item {
        Item {
            id,
            channel_id: 0,
            title: title.to_string(),
            description: None,
            link: Some(format!("https://example.com/{id}")),
            enclosure_url: None,
            enclosure_length: None,
            enclosure_type: None,
            pub_date: None,
            state: ItemState::New,
            downloaded: false,
        }
    }

    fn meta(title: &str) -> ChannelMeta {
        ChannelMeta {
            title: title.to_string(),
            description: Some("desc".to_string()),
            image: None,
            last_update: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_staging_swap_replaces_live_items() {
        let (db, ch) = test_db().await;
        db.insert_into(ItemArea::Live(ch), &item(1, "old"), 0)
            .await
            .unwrap();

        db.create_staging_area(ch).await.unwrap();
        db.insert_into(ItemArea::Staging(ch), &item(2, "second"), 1)
            .await
            .unwrap();
        db.insert_into(ItemArea::Staging(ch), &item(3, "first"), 0)
            .await
            .unwrap();

        // Live set unchanged until commit
        let before = db.query_items(ch).await.unwrap();
        assert_eq!(before.len(), 1);

        db.commit_staging(ch, &meta("Renamed")).await.unwrap();

        let titles: Vec<String> = db
            .query_items(ch)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(titles, vec!["first", "second"]);

        let channel = db.query_channel(ch).await.unwrap().unwrap();
        assert_eq!(channel.title, "Renamed");
        assert_eq!(channel.last_update, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_create_staging_twice_fails() {
        let (db, ch) = test_db().await;
        db.create_staging_area(ch).await.unwrap();
        assert!(db.create_staging_area(ch).await.is_err());

        db.drop_staging_area(ch).await.unwrap();
        db.drop_staging_area(ch).await.unwrap();
        db.create_staging_area(ch).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_for_unknown_channel_rolls_back() {
        let (db, ch) = test_db().await;
        db.insert_into(ItemArea::Live(ch), &item(1, "kept"), 0)
            .await
            .unwrap();

        // Staging table without a channel row behind it
        db.create_staging_area(999).await.unwrap();
        let err = db.commit_staging(999, &meta("x")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::ChannelNotFound(999)));

        // The staging table survived the rollback
        db.drop_staging_area(999).await.unwrap();
        assert_eq!(db.query_items(ch).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_meta_keeps_icon_when_none() {
        let (db, ch) = test_db().await;
        let mut with_icon = meta("A");
        with_icon.image = Some(vec![1, 2, 3]);
        db.update_channel_meta(ch, &with_icon).await.unwrap();
        db.update_channel_meta(ch, &meta("B")).await.unwrap();

        let channel = db.query_channel(ch).await.unwrap().unwrap();
        assert_eq!(channel.title, "B");
        assert_eq!(channel.image, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_update_missing_item_reports_no_row() {
        let (db, ch) = test_db().await;
        db.insert_into(ItemArea::Live(ch), &item(5, "x"), 0)
            .await
            .unwrap();

        assert!(db.update_item_state(ch, 5, ItemState::Read).await.unwrap());
        assert!(!db.update_item_state(ch, 6, ItemState::Read).await.unwrap());
        assert!(db.update_item_downloaded(ch, 5, true).await.unwrap());

        let stored = &db.query_items(ch).await.unwrap()[0];
        assert_eq!(stored.state, ItemState::Read);
        assert!(stored.downloaded);
    }

    #[tokio::test]
    async fn test_allocate_item_ids_hands_out_disjoint_blocks() {
        let (db, _) = test_db().await;
        let first = db.allocate_item_ids(3).await.unwrap();
        let second = db.allocate_item_ids(2).await.unwrap();
        assert_eq!(second, first + 3);
        let third = db.allocate_item_ids(0).await.unwrap();
        assert_eq!(third, second + 2);
    }
}
