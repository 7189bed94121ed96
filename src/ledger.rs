//! The dedup ledger: the one place that decides whether content is new.
//!
//! Every adapter funnels through [`DedupLedger::try_claim`]. A claim is a
//! single atomic statement and is durable once it returns, so two adapters
//! racing on the same `(source_id, content_id)` produce exactly one winner.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::event::ContentKind;
use crate::storage::{Database, DedupRecord};

#[derive(Clone)]
pub struct DedupLedger {
    db: Database,
    /// `None` keeps records forever
    retention: Option<Duration>,
}

impl DedupLedger {
    /// `retention_days == 0` disables pruning.
    pub fn new(db: Database, retention_days: u32) -> Self {
        let retention = (retention_days > 0).then(|| Duration::days(i64::from(retention_days)));
        Self { db, retention }
    }

    /// Record `(source_id, content_id)` as delivered. Returns true only for
    /// the caller that created the record.
    pub async fn try_claim(
        &self,
        source_id: &str,
        content_id: &str,
        classification: ContentKind,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.db
            .insert_dedup_record(source_id, content_id, classification, now)
            .await
    }

    /// Atomically flip an existing record from `from` to `to`. Returns true only
    /// for the caller that changed it; the record count for the key is unchanged.
    pub async fn try_reclassify(
        &self,
        source_id: &str,
        content_id: &str,
        from: ContentKind,
        to: ContentKind,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.db
            .reclassify_dedup_record(source_id, content_id, from, to, now)
            .await
    }

    pub async fn record(&self, source_id: &str, content_id: &str) -> Result<Option<DedupRecord>> {
        self.db.dedup_record(source_id, content_id).await
    }

    pub async fn len(&self) -> Result<i64> {
        self.db.count_dedup_records().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop records older than the retention window. Returns how many went.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let removed = self.db.delete_dedup_records_before(now - retention).await?;
        if removed > 0 {
            tracing::info!(removed, retention_days = retention.num_days(), "Pruned dedup ledger");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger(retention_days: u32) -> DedupLedger {
        DedupLedger::new(Database::open(":memory:").await.unwrap(), retention_days)
    }

    #[tokio::test]
    async fn test_claim_once() {
        let ledger = ledger(90).await;
        let now = Utc::now();
        assert!(ledger.try_claim("s", "c", ContentKind::Video, now).await.unwrap());
        assert!(!ledger.try_claim("s", "c", ContentKind::Video, now).await.unwrap());
        // classification is not part of the key
        assert!(!ledger.try_claim("s", "c", ContentKind::Live, now).await.unwrap());
        // a different source is a different key
        assert!(ledger.try_claim("t", "c", ContentKind::Video, now).await.unwrap());
        assert_eq!(ledger.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reclassify_only_from_expected_kind() {
        let ledger = ledger(90).await;
        let now = Utc::now();
        ledger.try_claim("s", "c", ContentKind::Live, now).await.unwrap();

        assert!(!ledger
            .try_reclassify("s", "c", ContentKind::Video, ContentKind::Live, now)
            .await
            .unwrap());
        assert!(ledger
            .try_reclassify("s", "c", ContentKind::Live, ContentKind::Video, now)
            .await
            .unwrap());
        assert!(!ledger
            .try_reclassify("s", "c", ContentKind::Live, ContentKind::Video, now)
            .await
            .unwrap());

        let record = ledger.record("s", "c").await.unwrap().unwrap();
        assert_eq!(record.classification, ContentKind::Video);
        assert_eq!(ledger.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_respects_retention() {
        let ledger = ledger(90).await;
        let now = Utc::now();
        ledger
            .try_claim("s", "old", ContentKind::Video, now - Duration::days(91))
            .await
            .unwrap();
        ledger.try_claim("s", "new", ContentKind::Video, now).await.unwrap();

        assert_eq!(ledger.prune(now).await.unwrap(), 1);
        assert!(ledger.record("s", "old").await.unwrap().is_none());
        assert!(ledger.record("s", "new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_everything() {
        let ledger = ledger(0).await;
        let now = Utc::now();
        ledger
            .try_claim("s", "ancient", ContentKind::Video, now - Duration::days(3650))
            .await
            .unwrap();
        assert_eq!(ledger.prune(now).await.unwrap(), 0);
        assert!(!ledger.is_empty().await.unwrap());
    }
}
