use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{from_unix, IntakeEvent, IntakeEventType, IntakeRow, NewIntakeEvent};

impl Database {
    // ========================================================================
    // Intake Queue Operations
    // ========================================================================

    /// Append a validated push notification.
    ///
    /// The hub re-sends notifications when a video's metadata changes, so a
    /// repeated `content_id` refreshes the metadata of the existing row instead
    /// of queueing a second one. `is_processed` is left untouched.
    pub async fn enqueue_intake(&self, event: &NewIntakeEvent, received_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO intake_events
                (content_id, source_id, title, channel_name, event_type, published_at, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                title = excluded.title,
                channel_name = excluded.channel_name,
                event_type = excluded.event_type
        "#,
        )
        .bind(&event.content_id)
        .bind(&event.source_id)
        .bind(&event.title)
        .bind(&event.channel_name)
        .bind(event.event_type.as_str())
        .bind(event.published_at.map(|p| p.timestamp()))
        .bind(received_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Oldest unprocessed intake records, at most `limit`.
    pub async fn pending_intake(&self, limit: i64) -> Result<Vec<IntakeEvent>> {
        let rows: Vec<IntakeRow> = sqlx::query_as(
            r#"
            SELECT id, content_id, source_id, title, channel_name,
                   event_type, published_at, received_at
            FROM intake_events
            WHERE is_processed = 0
            ORDER BY received_at ASC, id ASC
            LIMIT ?
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, content_id, source_id, title, channel_name, event_type, published_at, received_at)| {
                    let event_type = event_type.parse().unwrap_or_else(|e| {
                        tracing::debug!(intake_id = id, error = %e, "Unknown intake event type, treating as upload");
                        IntakeEventType::None
                    });
                    Ok(IntakeEvent {
                        id,
                        content_id,
                        source_id,
                        title,
                        channel_name,
                        event_type,
                        published_at: published_at.and_then(from_unix),
                        received_at: from_unix(received_at)
                            .ok_or_else(|| anyhow!("invalid received_at {received_at}"))?,
                    })
                },
            )
            .collect()
    }

    /// Flip `is_processed` and stamp `processed_at`. Returns false if the record
    /// was already processed (or does not exist).
    pub async fn mark_intake_processed(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE intake_events SET is_processed = 1, processed_at = ? WHERE id = ? AND is_processed = 0",
        )
        .bind(at.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
