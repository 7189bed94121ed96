//! Push adapter: drains hub notifications queued by the webhook receiver.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::CycleReport;
use crate::event::{ContentEvent, ContentKind};
use crate::pipeline::{Outcome, Pipeline};
use crate::storage::{Database, Feed, IntakeEvent};

pub struct PushAdapter {
    batch_size: i64,
    staleness: Duration,
}

impl PushAdapter {
    pub fn new(batch_size: usize, staleness: Duration) -> Self {
        Self {
            batch_size: i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX),
            staleness,
        }
    }

    /// Process every pending intake record, oldest first.
    ///
    /// Each record is marked processed exactly once whatever happens to it
    /// downstream. A ledger failure leaves the current record queued and ends
    /// the drain; it is picked up again next cycle.
    pub async fn drain(
        &self,
        db: &Database,
        pipeline: &Pipeline,
        feeds_by_source: &HashMap<String, Vec<Feed>>,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        loop {
            let batch = db.pending_intake(self.batch_size).await?;
            let full = i64::try_from(batch.len()).unwrap_or(i64::MAX) >= self.batch_size;

            for record in batch {
                report.checked += 1;
                let feeds = feeds_by_source
                    .get(&record.source_id)
                    .map(Vec::as_slice)
                    .unwrap_or_default();

                match self.handle(pipeline, &record, feeds, now).await {
                    Ok(Some(outcome)) => report.record(&outcome),
                    Ok(None) => {}
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!(
                            intake_id = record.id,
                            content_id = %record.content_id,
                            error = %e,
                            "Failed to process push notification, leaving it queued"
                        );
                        return Ok(report);
                    }
                }

                if !db.mark_intake_processed(record.id, now).await? {
                    tracing::debug!(intake_id = record.id, "Intake record already processed elsewhere");
                }
            }

            if !full {
                break;
            }
        }

        if report.checked > 0 {
            tracing::debug!(
                checked = report.checked,
                announced = report.announced,
                delivered = report.delivered,
                "Drained push intake"
            );
        }
        Ok(report)
    }

    /// [`drain`](Self::drain), with a storage failure folded into the report.
    pub async fn run_cycle(
        &self,
        db: &Database,
        pipeline: &Pipeline,
        feeds_by_source: &HashMap<String, Vec<Feed>>,
        now: DateTime<Utc>,
    ) -> CycleReport {
        match self.drain(db, pipeline, feeds_by_source, now).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Push intake drain failed");
                CycleReport {
                    errors: 1,
                    ..Default::default()
                }
            }
        }
    }

    async fn handle(
        &self,
        pipeline: &Pipeline,
        record: &IntakeEvent,
        feeds: &[Feed],
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>> {
        let Some(kind) = record.event_type.content_kind() else {
            tracing::debug!(content_id = %record.content_id, "Scheduled stream, waiting for it to go live");
            return Ok(None);
        };

        if feeds.is_empty() {
            tracing::debug!(
                source_id = %record.source_id,
                content_id = %record.content_id,
                "No feeds for pushed source, dropping"
            );
            return Ok(None);
        }

        let event = match kind {
            ContentKind::Video => ContentEvent::video(
                &record.source_id,
                &record.content_id,
                &record.title,
                &record.channel_name,
                None,
                record.published_at,
                now,
            ),
            ContentKind::Live => ContentEvent::live(
                &record.source_id,
                &record.content_id,
                &record.title,
                &record.channel_name,
                None,
                now,
            ),
        };

        if event.is_stale(now, self.staleness) {
            pipeline.mark_seen(&event).await?;
            tracing::debug!(content_id = %event.content_id, "Pushed entry is stale, marking seen");
            return Ok(None);
        }

        Ok(Some(pipeline.process(&event, feeds).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KindFilter;
    use crate::ledger::DedupLedger;
    use crate::notify::Renderer;
    use crate::pipeline::testing::RecordingDispatcher;
    use crate::pipeline::VodPolicy;
    use crate::storage::{IntakeEventType, NewIntakeEvent};
    use std::sync::Arc;

    const SOURCE: &str = "UCabcdefghijklmnopqrstuv";

    struct Harness {
        db: Database,
        pipeline: Pipeline,
        dispatcher: Arc<RecordingDispatcher>,
        feeds: HashMap<String, Vec<Feed>>,
    }

    async fn harness() -> Harness {
        let db = Database::open(":memory:").await.unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let pipeline = Pipeline::new(
            DedupLedger::new(db.clone(), 90),
            Renderer::default(),
            dispatcher.clone(),
            VodPolicy::Suppress,
        );
        let feed = Feed {
            id: 1,
            guild_id: "g".into(),
            source_reference: SOURCE.into(),
            delivery_target: "100".into(),
            kind_filter: KindFilter::Any,
            enabled: true,
            template: None,
        };
        Harness {
            db,
            pipeline,
            dispatcher,
            feeds: HashMap::from([(SOURCE.to_owned(), vec![feed])]),
        }
    }

    fn intake(content_id: &str, source_id: &str, event_type: IntakeEventType) -> NewIntakeEvent {
        NewIntakeEvent {
            content_id: content_id.into(),
            source_id: source_id.into(),
            title: format!("Video {content_id}"),
            channel_name: "Chan".into(),
            event_type,
            published_at: None,
        }
    }

    #[tokio::test]
    async fn test_every_record_processed_once() {
        let h = harness().await;
        let now = Utc::now();
        h.db.enqueue_intake(&intake("v1", SOURCE, IntakeEventType::None), now)
            .await
            .unwrap();
        h.db.enqueue_intake(&intake("s1", SOURCE, IntakeEventType::Upcoming), now)
            .await
            .unwrap();
        h.db.enqueue_intake(&intake("x1", "UCzzzzzzzzzzzzzzzzzzzzzz", IntakeEventType::None), now)
            .await
            .unwrap();

        let adapter = PushAdapter::new(50, Duration::hours(24));
        let report = adapter.drain(&h.db, &h.pipeline, &h.feeds, now).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.announced, 1);
        assert_eq!(report.delivered, 1);
        assert!(h.db.pending_intake(10).await.unwrap().is_empty());

        // nothing left to drain
        let again = adapter.drain(&h.db, &h.pipeline, &h.feeds, now).await.unwrap();
        assert_eq!(again, CycleReport::default());
        assert_eq!(h.dispatcher.sent.lock().await.len(), 1);
        // upcoming and unmatched records never touch the ledger
        assert_eq!(h.pipeline.ledger().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drains_across_batches() {
        let h = harness().await;
        let now = Utc::now();
        for i in 0..5 {
            h.db.enqueue_intake(&intake(&format!("v{i}"), SOURCE, IntakeEventType::None), now)
                .await
                .unwrap();
        }

        let adapter = PushAdapter::new(2, Duration::hours(24));
        let report = adapter.drain(&h.db, &h.pipeline, &h.feeds, now).await.unwrap();
        assert_eq!(report.checked, 5);
        assert_eq!(report.delivered, 5);
        assert!(h.db.pending_intake(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_push_mentions_everyone() {
        let h = harness().await;
        let now = Utc::now();
        h.db.enqueue_intake(&intake("l1", SOURCE, IntakeEventType::Live), now)
            .await
            .unwrap();

        PushAdapter::new(50, Duration::hours(24))
            .drain(&h.db, &h.pipeline, &h.feeds, now)
            .await
            .unwrap();
        let sent = h.dispatcher.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.mention_everyone);
    }

    #[tokio::test]
    async fn test_stale_push_is_claimed_silently() {
        let h = harness().await;
        let now = Utc::now();
        let mut old = intake("old", SOURCE, IntakeEventType::None);
        old.published_at = Some(now - Duration::days(3));
        h.db.enqueue_intake(&old, now).await.unwrap();

        let report = PushAdapter::new(50, Duration::hours(24))
            .drain(&h.db, &h.pipeline, &h.feeds, now)
            .await
            .unwrap();
        assert_eq!(report.announced, 0);
        assert!(h.dispatcher.sent.lock().await.is_empty());
        assert!(h.pipeline.ledger().record(SOURCE, "old").await.unwrap().is_some());
        assert!(h.db.pending_intake(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_after_poll_is_silent() {
        let h = harness().await;
        let now = Utc::now();
        let polled = ContentEvent::video(SOURCE, "v1", "Video v1", "Chan", None, None, now);
        h.pipeline.process(&polled, &h.feeds[SOURCE]).await.unwrap();

        h.db.enqueue_intake(&intake("v1", SOURCE, IntakeEventType::None), now)
            .await
            .unwrap();
        let report = PushAdapter::new(50, Duration::hours(24))
            .drain(&h.db, &h.pipeline, &h.feeds, now)
            .await
            .unwrap();
        assert_eq!(report.announced, 0);
        assert_eq!(h.dispatcher.sent.lock().await.len(), 1);
    }
}
