use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use super::schema::Database;
use super::types::{from_unix, Subscription, SubscriptionRow, SubscriptionStatus};

fn into_subscription(row: SubscriptionRow) -> Result<Subscription> {
    let (source_id, status, expires_at, consecutive_failures, last_attempt_at) = row;
    Ok(Subscription {
        source_id,
        status: status.parse()?,
        expires_at: expires_at.and_then(from_unix),
        consecutive_failures,
        last_attempt_at: last_attempt_at.and_then(from_unix),
    })
}

impl Database {
    // ========================================================================
    // Subscription Lease Operations
    // ========================================================================

    pub async fn subscription(&self, source_id: &str) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT source_id, status, expires_at, consecutive_failures, last_attempt_at
            FROM subscriptions
            WHERE source_id = ?
        "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_subscription).transpose()
    }

    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT source_id, status, expires_at, consecutive_failures, last_attempt_at
            FROM subscriptions
            ORDER BY source_id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(into_subscription).collect()
    }

    /// Record a newly seen source as `pending`. Returns false if the source was already known.
    pub async fn insert_pending_subscription(&self, source_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (source_id, status, updated_at)
            VALUES (?, 'pending', ?)
            ON CONFLICT(source_id) DO NOTHING
        "#,
        )
        .bind(source_id)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist the outcome of a subscribe attempt.
    pub async fn save_subscription(&self, sub: &Subscription, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (source_id, status, expires_at, consecutive_failures, last_attempt_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                status = excluded.status,
                expires_at = excluded.expires_at,
                consecutive_failures = excluded.consecutive_failures,
                last_attempt_at = excluded.last_attempt_at,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(&sub.source_id)
        .bind(sub.status.as_str())
        .bind(sub.expires_at.map(|e| e.timestamp()))
        .bind(sub.consecutive_failures)
        .bind(sub.last_attempt_at.map(|a| a.timestamp()))
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Hub verification callback: the hub confirmed a lease of `lease_seconds`.
    ///
    /// Called by the webhook receiver when it answers a `hub.mode=subscribe`
    /// challenge. Moves the source to `active` and resets its failure count.
    pub async fn confirm_subscription(
        &self,
        source_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sub = Subscription {
            source_id: source_id.to_owned(),
            status: SubscriptionStatus::Active,
            expires_at: Some(now + Duration::seconds(lease_seconds.max(0))),
            consecutive_failures: 0,
            last_attempt_at: self
                .subscription(source_id)
                .await?
                .and_then(|s| s.last_attempt_at),
        };
        self.save_subscription(&sub, now).await
    }

    /// Forget a lease. Returns false if the source was unknown.
    pub async fn delete_subscription(&self, source_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
