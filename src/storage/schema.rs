use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{DatabaseError, DEFAULT_CATEGORY_ID};

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Pre-create the file with owner-only permissions
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if db_path.parent().is_some_and(|p| p.as_os_str().is_empty() || p.exists()) {
                // If creation fails, SQLite reports the error at connect_with.
                let _ = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path);
            }
        }

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .foreign_keys(true);

        // Every pooled connection to ":memory:" would get its own empty
        // database, so the in-memory store is pinned to one connection.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Migration(e.to_string()),
            other => other,
        })?;
        Ok(db)
    }

    /// Create the fixed tables inside one transaction.
    ///
    /// Item tables are per channel and are created by `subscribe_channel`
    /// and the staging swap, not here. Every statement is `IF NOT EXISTS`
    /// or `OR IGNORE`, so re-running on an existing database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO categories (id, name) VALUES (?, 'Default')")
            .bind(DEFAULT_CATEGORY_ID)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                image BLOB,
                action INTEGER NOT NULL DEFAULT 0,
                item_order INTEGER NOT NULL DEFAULT 0,
                last_update INTEGER,
                category_id INTEGER NOT NULL DEFAULT 0 REFERENCES categories(id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_channels_category ON channels(category_id)")
            .execute(&mut *tx)
            .await?;

        // Store-wide counters; `next_item_id` keeps item ids unique across
        // every per-channel table.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('next_item_id', 1)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Column layout shared by `items_<id>` and `items_temp_<id>`.
pub(crate) fn item_table_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            link TEXT,
            enclosure_url TEXT,
            enclosure_length INTEGER,
            enclosure_type TEXT,
            pub_date TEXT,
            state INTEGER NOT NULL DEFAULT 0,
            downloaded INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL
        )
    "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_creates_default_category() {
        let db = Database::open(":memory:").await.unwrap();
        let row: (String,) = sqlx::query_as("SELECT name FROM categories WHERE id = 0")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, "Default");
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        sqlx::query("UPDATE meta SET value = 42 WHERE key = 'next_item_id'")
            .execute(&db.pool)
            .await
            .unwrap();
        db.pool.close().await;

        let db = Database::open(path).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT value FROM meta WHERE key = 'next_item_id'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 42);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_database_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perm.db");
        let _db = Database::open(path.to_str().unwrap()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
