//! Poll-feed adapter: the channel's Atom feed, newest entry only.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::fetcher::{fetch_bytes, FetchError};
use super::parser::{newest_entry, FeedEntry};
use super::status::StatusClient;
use super::{CycleReport, SourceGroup};
use crate::event::{ContentEvent, ContentKind};
use crate::pipeline::{Outcome, Pipeline};
use crate::storage::{Database, IntakeEventType};

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Document had no entries
    Empty,
    /// First poll of this source: newest entry recorded, nothing delivered
    Baseline,
    /// Newest entry is the one seen last time
    Unchanged,
    /// New newest entry, but published too long ago to announce
    Stale,
    /// Newest entry is a stream that has not started; looked at again next poll
    Scheduled,
    Announced(Outcome),
}

pub struct SyndicationAdapter {
    client: reqwest::Client,
    feeds_base: String,
    timeout: std::time::Duration,
    staleness: Duration,
    max_concurrency: usize,
    status: Option<Arc<StatusClient>>,
}

impl SyndicationAdapter {
    pub fn new(
        client: reqwest::Client,
        feeds_base: impl Into<String>,
        timeout: std::time::Duration,
        staleness: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            client,
            feeds_base: feeds_base.into().trim_end_matches('/').to_owned(),
            timeout,
            staleness,
            max_concurrency: max_concurrency.max(1),
            status: None,
        }
    }

    /// Classify new entries through the Data API, so streams listed in the
    /// feed are announced as live rather than as uploads.
    pub fn with_status(mut self, status: Arc<StatusClient>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn feed_url(&self, source_id: &str) -> String {
        format!("{}/feeds/videos.xml?channel_id={}", self.feeds_base, source_id)
    }

    pub async fn fetch_newest(&self, source_id: &str) -> Result<Option<FeedEntry>, FetchError> {
        let bytes = fetch_bytes(self.client.get(self.feed_url(source_id)), self.timeout).await?;
        newest_entry(&bytes)
    }

    /// Broadcast state of a new entry. Without a Data API key every entry
    /// is an upload; a quota or auth failure degrades to the same.
    async fn classify(&self, content_id: &str) -> Result<IntakeEventType, FetchError> {
        let Some(status) = self.status.as_ref().filter(|s| s.is_enabled()) else {
            return Ok(IntakeEventType::None);
        };
        match status.broadcast_status(content_id).await {
            Err(e) if e.is_quota_or_auth() => {
                tracing::warn!(content_id = %content_id, error = %e, "Cannot classify entry, treating it as an upload");
                Ok(IntakeEventType::None)
            }
            other => other,
        }
    }

    /// Poll one source and push its newest entry through the pipeline if it is new.
    ///
    /// The cursor only advances once the ledger has recorded the entry, so
    /// any failure leaves the source to be polled again from the same state.
    pub async fn poll(
        &self,
        db: &Database,
        pipeline: &Pipeline,
        group: &SourceGroup,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome> {
        let source_id = group.source_id.as_str();
        let Some(entry) = self.fetch_newest(source_id).await? else {
            tracing::debug!(source_id = %source_id, "Syndication feed is empty");
            return Ok(PollOutcome::Empty);
        };

        let cursor = db.poll_cursor(source_id).await?;
        if cursor.as_deref() == Some(entry.content_id.as_str()) {
            return Ok(PollOutcome::Unchanged);
        }

        let event = match self.classify(&entry.content_id).await? {
            IntakeEventType::Upcoming => {
                tracing::debug!(source_id = %source_id, content_id = %entry.content_id, "Newest entry is a scheduled stream, waiting for it to start");
                return Ok(PollOutcome::Scheduled);
            }
            IntakeEventType::Live => ContentEvent::live(
                source_id,
                &entry.content_id,
                entry.title,
                entry.channel_name,
                entry.thumbnail_url,
                now,
            ),
            IntakeEventType::None => ContentEvent::video(
                source_id,
                &entry.content_id,
                entry.title,
                entry.channel_name,
                entry.thumbnail_url,
                entry.published_at,
                now,
            ),
        };

        let outcome = if cursor.is_none() {
            // A stream already running at startup is the live check's to announce
            if event.kind == ContentKind::Video {
                pipeline.mark_seen(&event).await?;
            }
            tracing::info!(source_id = %source_id, content_id = %event.content_id, "First poll, caching newest entry without announcing");
            PollOutcome::Baseline
        } else if event.is_stale(now, self.staleness) {
            pipeline.mark_seen(&event).await?;
            tracing::debug!(source_id = %source_id, content_id = %event.content_id, "Newest entry is stale, marking seen");
            PollOutcome::Stale
        } else {
            PollOutcome::Announced(pipeline.process(&event, &group.feeds).await?)
        };

        db.set_poll_cursor(source_id, &event.content_id, now).await?;
        Ok(outcome)
    }

    /// Poll every group concurrently. A quota or auth failure stops sources
    /// that have not started yet; any other failure only skips its source.
    pub async fn run_cycle(
        &self,
        db: &Database,
        pipeline: &Pipeline,
        groups: Vec<SourceGroup>,
        now: DateTime<Utc>,
    ) -> CycleReport {
        let abort = AtomicBool::new(false);
        let report = Mutex::new(CycleReport::default());

        stream::iter(groups)
            .for_each_concurrent(self.max_concurrency, |group| {
                let abort = &abort;
                let report = &report;
                async move {
                    if abort.load(Ordering::Relaxed) {
                        return;
                    }
                    let result = self.poll(db, pipeline, &group, now).await;

                    let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
                    report.checked += 1;
                    match result {
                        Ok(PollOutcome::Announced(outcome)) => report.record(&outcome),
                        Ok(_) => {}
                        Err(e) => {
                            report.errors += 1;
                            match e.downcast_ref::<FetchError>() {
                                Some(fetch) if fetch.is_quota_or_auth() => {
                                    abort.store(true, Ordering::Relaxed);
                                    report.aborted = true;
                                    tracing::error!(source_id = %group.source_id, error = %fetch, "Syndication quota or auth failure, abandoning cycle");
                                }
                                Some(fetch) if fetch.is_transient() => {
                                    tracing::warn!(source_id = %group.source_id, error = %fetch, "Syndication fetch failed, skipping source");
                                }
                                Some(fetch) => {
                                    tracing::error!(source_id = %group.source_id, error = %fetch, "Syndication feed unusable, skipping source");
                                }
                                None => {
                                    tracing::error!(source_id = %group.source_id, error = %e, "Syndication poll failed");
                                }
                            }
                        }
                    }
                }
            })
            .await;

        report.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}
