use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{from_unix, DedupRecord};
use crate::event::ContentKind;

impl Database {
    // ========================================================================
    // Dedup Ledger Operations
    // ========================================================================
    //
    // Only `crate::ledger::DedupLedger` writes through these.

    /// Insert a dedup record unless one already exists for the key.
    ///
    /// A single `INSERT .. ON CONFLICT DO NOTHING` statement: the check and the
    /// insert cannot interleave with another writer. Returns true if this call
    /// inserted the row.
    pub(crate) async fn insert_dedup_record(
        &self,
        source_id: &str,
        content_id: &str,
        classification: ContentKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dedup_ledger (source_id, content_id, classification, delivered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_id, content_id) DO NOTHING
        "#,
        )
        .bind(source_id)
        .bind(content_id)
        .bind(classification.as_str())
        .bind(at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Change the classification of an existing record if it currently equals `from`.
    ///
    /// Conditional single-statement update; of two concurrent callers only one
    /// sees a changed row.
    pub(crate) async fn reclassify_dedup_record(
        &self,
        source_id: &str,
        content_id: &str,
        from: ContentKind,
        to: ContentKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_ledger
            SET classification = ?, delivered_at = ?
            WHERE source_id = ? AND content_id = ? AND classification = ?
        "#,
        )
        .bind(to.as_str())
        .bind(at.timestamp())
        .bind(source_id)
        .bind(content_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub(crate) async fn dedup_record(
        &self,
        source_id: &str,
        content_id: &str,
    ) -> Result<Option<DedupRecord>> {
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT source_id, content_id, classification, delivered_at
            FROM dedup_ledger
            WHERE source_id = ? AND content_id = ?
        "#,
        )
        .bind(source_id)
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(source_id, content_id, classification, delivered_at)| {
            Ok(DedupRecord {
                source_id,
                content_id,
                classification: classification.parse()?,
                delivered_at: from_unix(delivered_at)
                    .ok_or_else(|| anyhow!("invalid delivered_at {delivered_at}"))?,
            })
        })
        .transpose()
    }

    pub(crate) async fn count_dedup_records(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dedup_ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete records whose `delivered_at` is before `cutoff`. Returns the number removed.
    pub(crate) async fn delete_dedup_records_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dedup_ledger WHERE delivered_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
