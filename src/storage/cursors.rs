use anyhow::Result;
use chrono::{DateTime, Utc};

use super::schema::Database;

impl Database {
    // ========================================================================
    // Poll Cursor Operations
    // ========================================================================

    /// The newest syndication entry previously seen for a source, if any.
    pub async fn poll_cursor(&self, source_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_content_id FROM poll_cursors WHERE source_id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    pub async fn set_poll_cursor(
        &self,
        source_id: &str,
        content_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO poll_cursors (source_id, last_content_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                last_content_id = excluded.last_content_id,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(source_id)
        .bind(content_id)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
