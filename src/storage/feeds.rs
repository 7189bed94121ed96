use anyhow::Result;

use super::schema::Database;
use super::types::{Feed, FeedRow, NewFeed};

impl Database {
    // ========================================================================
    // Feed Registry Operations
    // ========================================================================

    /// All enabled feeds, in registry order.
    ///
    /// Rows with an unrecognised `kind_filter` are logged and skipped so one bad
    /// row cannot stop every other feed from being served.
    pub async fn active_feeds(&self) -> Result<Vec<Feed>> {
        let rows: Vec<FeedRow> = sqlx::query_as(
            r#"
            SELECT id, guild_id, source_reference, delivery_target,
                   kind_filter, is_enabled, template_json
            FROM notification_feeds
            WHERE is_enabled = 1
            ORDER BY id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let feeds = rows
            .into_iter()
            .filter_map(
                |(id, guild_id, source_reference, delivery_target, kind_filter, enabled, template)| {
                    match kind_filter.parse() {
                        Ok(kind_filter) => Some(Feed {
                            id,
                            guild_id,
                            source_reference,
                            delivery_target,
                            kind_filter,
                            enabled,
                            template: template.filter(|t| !t.trim().is_empty()),
                        }),
                        Err(e) => {
                            tracing::warn!(feed_id = id, error = %e, "Skipping feed with unknown kind filter");
                            None
                        }
                    }
                },
            )
            .collect();

        Ok(feeds)
    }

    /// Register a feed. Used by the operator command layer; the notification
    /// core itself never writes to the registry.
    pub async fn register_feed(&self, feed: &NewFeed) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO notification_feeds
                (guild_id, source_reference, delivery_target, kind_filter, is_enabled, template_json)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&feed.guild_id)
        .bind(&feed.source_reference)
        .bind(&feed.delivery_target)
        .bind(feed.kind_filter.as_str())
        .bind(feed.enabled)
        .bind(&feed.template)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}
