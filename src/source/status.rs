//! Poll-status adapter: asks the Data API whether a channel is live.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::fetcher::{fetch_bytes, FetchError};
use super::{CycleReport, SourceGroup};
use crate::event::ContentEvent;
use crate::pipeline::{Outcome, Pipeline};
use crate::storage::IntakeEventType;
use crate::util::strip_control_chars;

// ============================================================================
// Data API client
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchId,
    #[serde(default)]
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
struct SearchId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Snippet {
    title: String,
    #[serde(rename = "channelTitle")]
    channel_title: String,
    #[serde(rename = "liveBroadcastContent")]
    live_broadcast_content: String,
    thumbnails: HashMap<String, Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    #[serde(default)]
    snippet: Snippet,
}

/// A channel's current live broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveStream {
    pub video_id: String,
    pub title: String,
    pub channel_name: String,
    pub thumbnail_url: Option<String>,
}

/// Keyed client for the Data API. Disabled when no key is configured.
pub struct StatusClient {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl StatusClient {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            api_key,
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let Some(key) = &self.api_key else {
            return Err(FetchError::QuotaOrAuth(401));
        };
        let request = self
            .client
            .get(format!("{}/{}", self.api_base, endpoint))
            .query(params)
            .query(&[("key", key.expose_secret())]);
        let bytes = fetch_bytes(request, self.timeout).await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))
    }

    /// The channel's current live broadcast, `None` when it is not live.
    pub async fn live_stream(&self, channel_id: &str) -> Result<Option<LiveStream>, FetchError> {
        let response: SearchResponse = self
            .get(
                "search",
                &[
                    ("part", "snippet"),
                    ("channelId", channel_id),
                    ("eventType", "live"),
                    ("type", "video"),
                ],
            )
            .await?;

        let stream = response.items.into_iter().find_map(|item| {
            let video_id = item.id.video_id.filter(|v| !v.is_empty())?;
            let snippet = item.snippet;
            let thumbnail_url = ["high", "medium", "default"]
                .iter()
                .find_map(|size| snippet.thumbnails.get(*size))
                .map(|t| t.url.clone())
                .filter(|u| !u.is_empty());
            Some(LiveStream {
                video_id,
                title: strip_control_chars(&snippet.title).into_owned(),
                channel_name: strip_control_chars(&snippet.channel_title).into_owned(),
                thumbnail_url,
            })
        });
        Ok(stream)
    }

    /// Broadcast state of a single video, used to classify push notifications.
    /// Unknown videos are treated as plain uploads.
    pub async fn broadcast_status(&self, video_id: &str) -> Result<IntakeEventType, FetchError> {
        let response: VideosResponse = self
            .get(
                "videos",
                &[("part", "snippet,liveStreamingDetails"), ("id", video_id)],
            )
            .await?;

        Ok(response
            .items
            .into_iter()
            .next()
            .and_then(|item| item.snippet.live_broadcast_content.parse().ok())
            .unwrap_or(IntakeEventType::None))
    }
}

// ============================================================================
// Live tracker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveTransition {
    /// Live with a broadcast not seen before; announce it
    Started,
    /// Still live with the same broadcast
    Unchanged,
    /// Was live, is not any more
    Ended,
    /// Not live, was not live
    Offline,
}

/// Last observed live broadcast per source. In memory only, separate from
/// the dedup ledger.
#[derive(Debug, Default)]
pub struct LiveTracker {
    markers: Mutex<HashMap<String, String>>,
}

impl LiveTracker {
    pub async fn observe(&self, source_id: &str, live_video: Option<&str>) -> LiveTransition {
        let mut markers = self.markers.lock().await;
        match live_video {
            Some(video_id) => {
                let previous = markers.insert(source_id.to_owned(), video_id.to_owned());
                if previous.as_deref() == Some(video_id) {
                    LiveTransition::Unchanged
                } else {
                    LiveTransition::Started
                }
            }
            None => {
                if markers.remove(source_id).is_some() {
                    LiveTransition::Ended
                } else {
                    LiveTransition::Offline
                }
            }
        }
    }

    pub async fn current(&self, source_id: &str) -> Option<String> {
        self.markers.lock().await.get(source_id).cloned()
    }

    /// Drop the marker if it still points at `video_id`, so the next
    /// observation of that broadcast counts as a start again.
    pub async fn forget(&self, source_id: &str, video_id: &str) {
        let mut markers = self.markers.lock().await;
        if markers.get(source_id).map(String::as_str) == Some(video_id) {
            markers.remove(source_id);
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct StatusAdapter {
    client: Arc<StatusClient>,
    tracker: LiveTracker,
    max_concurrency: usize,
}

impl StatusAdapter {
    pub fn new(client: StatusClient, max_concurrency: usize) -> Self {
        Self {
            client: Arc::new(client),
            tracker: LiveTracker::default(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn client(&self) -> &Arc<StatusClient> {
        &self.client
    }

    pub fn tracker(&self) -> &LiveTracker {
        &self.tracker
    }

    /// Check one source. Fetch failures leave its marker untouched; a ledger
    /// failure drops the new marker so the broadcast is tried again.
    pub async fn check(
        &self,
        pipeline: &Pipeline,
        group: &SourceGroup,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>> {
        let stream = self.client.live_stream(&group.source_id).await?;

        match self
            .tracker
            .observe(&group.source_id, stream.as_ref().map(|s| s.video_id.as_str()))
            .await
        {
            LiveTransition::Started => {}
            LiveTransition::Ended => {
                tracing::info!(source_id = %group.source_id, "Stream ended");
                return Ok(None);
            }
            LiveTransition::Unchanged | LiveTransition::Offline => return Ok(None),
        }

        let Some(stream) = stream else {
            return Ok(None);
        };
        tracing::info!(source_id = %group.source_id, video_id = %stream.video_id, title = %stream.title, "Live broadcast detected");

        let event = ContentEvent::live(
            &group.source_id,
            stream.video_id,
            stream.title,
            stream.channel_name,
            stream.thumbnail_url,
            now,
        );
        match pipeline.process(&event, &group.feeds).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                self.tracker.forget(&group.source_id, &event.content_id).await;
                Err(e)
            }
        }
    }

    /// Check every group. A quota or auth failure abandons the rest of the cycle.
    pub async fn run_cycle(
        &self,
        pipeline: &Pipeline,
        groups: Vec<SourceGroup>,
        now: DateTime<Utc>,
    ) -> CycleReport {
        if !self.client.is_enabled() {
            tracing::debug!("Live status checks disabled (no API key)");
            return CycleReport::default();
        }

        let abort = AtomicBool::new(false);
        let report = std::sync::Mutex::new(CycleReport::default());

        stream::iter(groups)
            .for_each_concurrent(self.max_concurrency, |group| {
                let abort = &abort;
                let report = &report;
                async move {
                    if abort.load(Ordering::Relaxed) {
                        return;
                    }
                    let result = self.check(pipeline, &group, now).await;

                    let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
                    report.checked += 1;
                    match result {
                        Ok(Some(outcome)) => report.record(&outcome),
                        Ok(None) => {}
                        Err(e) => {
                            report.errors += 1;
                            match e.downcast_ref::<FetchError>() {
                                Some(fetch) if fetch.is_quota_or_auth() => {
                                    abort.store(true, Ordering::Relaxed);
                                    report.aborted = true;
                                    tracing::error!(error = %fetch, "Data API quota exceeded or key rejected, abandoning live check cycle");
                                }
                                Some(fetch) if fetch.is_transient() => {
                                    tracing::warn!(source_id = %group.source_id, error = %fetch, "Live status check failed, skipping source");
                                }
                                Some(fetch) => {
                                    tracing::error!(source_id = %group.source_id, error = %fetch, "Live status response unusable, skipping source");
                                }
                                None => {
                                    tracing::error!(source_id = %group.source_id, error = %e, "Live status check failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ContentKind, KindFilter};
    use crate::ledger::DedupLedger;
    use crate::notify::Renderer;
    use crate::pipeline::testing::RecordingDispatcher;
    use crate::pipeline::VodPolicy;
    use crate::storage::{Database, Feed};
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SOURCE: &str = "UCabcdefghijklmnopqrstuv";

    fn live_body(video_id: &str) -> serde_json::Value {
        serde_json::json!({
            "items": [{
                "id": {"kind": "youtube#video", "videoId": video_id},
                "snippet": {
                    "title": "Stream",
                    "channelTitle": "Chan",
                    "liveBroadcastContent": "live",
                    "thumbnails": {"high": {"url": format!("https://i.ytimg.com/vi/{video_id}/hqdefault_live.jpg")}}
                }
            }]
        })
    }

    async fn serve(server: &MockServer, body: serde_json::Value) {
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("channelId", SOURCE))
            .and(query_param("eventType", "live"))
            .and(query_param("key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    fn client(server: &MockServer, key: Option<&str>) -> StatusClient {
        StatusClient::new(
            reqwest::Client::new(),
            server.uri(),
            key.map(SecretString::from),
            Duration::from_secs(5),
        )
    }

    async fn pipeline(dispatcher: Arc<RecordingDispatcher>) -> Pipeline {
        let db = Database::open(":memory:").await.unwrap();
        Pipeline::new(DedupLedger::new(db, 90), Renderer::default(), dispatcher, VodPolicy::Suppress)
    }

    fn group() -> SourceGroup {
        SourceGroup {
            source_id: SOURCE.into(),
            feeds: vec![Feed {
                id: 1,
                guild_id: "g".into(),
                source_reference: SOURCE.into(),
                delivery_target: "100".into(),
                kind_filter: KindFilter::LiveOnly,
                enabled: true,
                template: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_tracker_transitions() {
        let tracker = LiveTracker::default();
        assert_eq!(tracker.observe("s", None).await, LiveTransition::Offline);
        assert_eq!(tracker.observe("s", Some("a")).await, LiveTransition::Started);
        assert_eq!(tracker.observe("s", Some("a")).await, LiveTransition::Unchanged);
        assert_eq!(tracker.observe("s", Some("b")).await, LiveTransition::Started);
        assert_eq!(tracker.observe("s", None).await, LiveTransition::Ended);
        assert_eq!(tracker.current("s").await, None);
    }

    #[tokio::test]
    async fn test_same_stream_announced_once_new_stream_again() {
        let server = MockServer::start().await;
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let pipeline = pipeline(dispatcher.clone()).await;
        let adapter = StatusAdapter::new(client(&server, Some("k")), 4);
        let now = Utc::now();

        serve(&server, live_body("live1")).await;
        let first = adapter.check(&pipeline, &group(), now).await.unwrap();
        assert_eq!(first.map(|o| o.delivered), Some(1));
        assert_eq!(adapter.check(&pipeline, &group(), now).await.unwrap(), None);

        // a different broadcast without ever observing "ended"
        serve(&server, live_body("live2")).await;
        assert!(adapter.check(&pipeline, &group(), now).await.unwrap().is_some());

        let sent = dispatcher.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.mention_everyone);
        let record = pipeline.ledger().record(SOURCE, "live2").await.unwrap().unwrap();
        assert_eq!(record.classification, ContentKind::Live);
    }

    #[tokio::test]
    async fn test_stream_end_clears_marker_silently() {
        let server = MockServer::start().await;
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let pipeline = pipeline(dispatcher.clone()).await;
        let adapter = StatusAdapter::new(client(&server, Some("k")), 4);
        let now = Utc::now();

        serve(&server, live_body("live1")).await;
        adapter.check(&pipeline, &group(), now).await.unwrap();
        serve(&server, serde_json::json!({"items": []})).await;
        assert_eq!(adapter.check(&pipeline, &group(), now).await.unwrap(), None);
        assert_eq!(adapter.tracker().current(SOURCE).await, None);
        assert_eq!(dispatcher.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_marker() {
        let server = MockServer::start().await;
        let pipeline = pipeline(Arc::new(RecordingDispatcher::default())).await;
        let adapter = StatusAdapter::new(client(&server, Some("k")), 4);

        serve(&server, live_body("live1")).await;
        adapter.check(&pipeline, &group(), Utc::now()).await.unwrap();

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        assert!(adapter.check(&pipeline, &group(), Utc::now()).await.is_err());
        assert_eq!(adapter.tracker().current(SOURCE).await.as_deref(), Some("live1"));
    }

    #[tokio::test]
    async fn test_quota_abandons_cycle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;
        let pipeline = pipeline(Arc::new(RecordingDispatcher::default())).await;
        let adapter = StatusAdapter::new(client(&server, Some("k")), 1);

        let groups = vec![group(), group(), group()];
        let report = adapter.run_cycle(&pipeline, groups, Utc::now()).await;
        assert!(report.aborted);
        assert_eq!(report.checked, 1);
    }

    #[tokio::test]
    async fn test_disabled_without_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let pipeline = pipeline(Arc::new(RecordingDispatcher::default())).await;
        let adapter = StatusAdapter::new(client(&server, None), 4);

        let report = adapter.run_cycle(&pipeline, vec![group()], Utc::now()).await;
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/videos"))
            .and(query_param("id", "up1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"snippet": {"title": "Soon", "liveBroadcastContent": "upcoming"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/videos"))
            .and(query_param("id", "gone"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .mount(&server)
            .await;

        let c = client(&server, Some("k"));
        assert_eq!(c.broadcast_status("up1").await.unwrap(), IntakeEventType::Upcoming);
        assert_eq!(c.broadcast_status("gone").await.unwrap(), IntakeEventType::None);
    }

    #[tokio::test]
    async fn test_ledger_failure_retries_broadcast() {
        let server = MockServer::start().await;
        let db = Database::open(":memory:").await.unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let pipeline = Pipeline::new(
            DedupLedger::new(db.clone(), 90),
            Renderer::default(),
            dispatcher.clone(),
            VodPolicy::Suppress,
        );
        let adapter = StatusAdapter::new(client(&server, Some("k")), 4);
        let now = Utc::now();
        serve(&server, live_body("live1")).await;

        sqlx::query("ALTER TABLE dedup_ledger RENAME TO dedup_ledger_offline")
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(adapter.check(&pipeline, &group(), now).await.is_err());
        assert_eq!(adapter.tracker().current(SOURCE).await, None);

        sqlx::query("ALTER TABLE dedup_ledger_offline RENAME TO dedup_ledger")
            .execute(&db.pool)
            .await
            .unwrap();
        let outcome = adapter.check(&pipeline, &group(), now).await.unwrap();
        assert_eq!(outcome.map(|o| o.delivered), Some(1));
        assert_eq!(dispatcher.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_only_matching_marker() {
        let tracker = LiveTracker::default();
        tracker.observe("s", Some("a")).await;
        tracker.forget("s", "b").await;
        assert_eq!(tracker.current("s").await.as_deref(), Some("a"));
        tracker.forget("s", "a").await;
        assert_eq!(tracker.current("s").await, None);
    }
}
