use anyhow::{bail, Result};

use super::schema::Database;
use super::types::{Category, DEFAULT_CATEGORY_ID};
use crate::util::strip_control_chars;

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================

    /// SEC-014: Strip control characters and surrounding whitespace from a
    /// category name, rejecting names that end up empty.
    fn sanitize_category_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            bail!("Category name cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// Create a category, returning its id.
    pub async fn create_category(&self, name: &str) -> Result<i64> {
        let clean_name = Self::sanitize_category_name(name)?;

        let row: (i64,) = sqlx::query_as("INSERT INTO categories (name) VALUES (?) RETURNING id")
            .bind(&clean_name)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    /// Id of the category named `name`, creating it when absent.
    pub async fn ensure_category(&self, name: &str) -> Result<i64> {
        let clean_name = Self::sanitize_category_name(name)?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM categories WHERE name = ? ORDER BY id LIMIT 1")
                .bind(&clean_name)
                .fetch_optional(&self.pool)
                .await?;
        match existing {
            Some((id,)) => Ok(id),
            None => self.create_category(&clean_name).await,
        }
    }

    pub async fn rename_category(&self, id: i64, new_name: &str) -> Result<()> {
        let clean_name = Self::sanitize_category_name(new_name)?;

        let result = sqlx::query("UPDATE categories SET name = ? WHERE id = ?")
            .bind(&clean_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("Category {} not found", id);
        }
        Ok(())
    }

    /// Delete a category, moving its channels to the default category.
    ///
    /// The default category itself cannot be deleted.
    pub async fn delete_category(&self, id: i64) -> Result<()> {
        if id == DEFAULT_CATEGORY_ID {
            bail!("The default category cannot be deleted");
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE channels SET category_id = ? WHERE category_id = ?")
            .bind(DEFAULT_CATEGORY_ID)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// All categories, default first.
    pub async fn get_categories(&self) -> Result<Vec<Category>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM categories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name)| Category { id, name })
            .collect())
    }
}
