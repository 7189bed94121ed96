//! Normalized content observations shared by every adapter.
//!
//! A [`ContentEvent`] is built once by an adapter, then only read by the
//! ledger, renderer and dispatcher. Its identity is `(source_id, content_id)`.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What kind of content an event announces.
///
/// Doubles as the classification stored on a dedup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Video,
    Live,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Video => "video",
            ContentKind::Live => "live",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown value: {0}")]
pub struct UnknownValue(pub String);

impl FromStr for ContentKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(ContentKind::Video),
            "live" => Ok(ContentKind::Live),
            other => Err(UnknownValue(other.to_owned())),
        }
    }
}

/// Which event kinds a feed wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindFilter {
    #[default]
    Any,
    VideoOnly,
    LiveOnly,
}

impl KindFilter {
    pub fn accepts(self, kind: ContentKind) -> bool {
        match self {
            KindFilter::Any => true,
            KindFilter::VideoOnly => kind == ContentKind::Video,
            KindFilter::LiveOnly => kind == ContentKind::Live,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KindFilter::Any => "any",
            KindFilter::VideoOnly => "video",
            KindFilter::LiveOnly => "live",
        }
    }
}

impl FromStr for KindFilter {
    type Err = UnknownValue;

    /// Accepts the registry's historical spellings too (`youtube` meant uploads).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "all" => Ok(KindFilter::Any),
            "video" | "video_only" | "video-only" | "youtube" => Ok(KindFilter::VideoOnly),
            "live" | "live_only" | "live-only" => Ok(KindFilter::LiveOnly),
            other => Err(UnknownValue(other.to_owned())),
        }
    }
}

/// Watch page for a video id.
pub fn watch_url(content_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", content_id)
}

/// Thumbnail used when the source did not supply one.
pub fn default_thumbnail(content_id: &str) -> String {
    format!("https://img.youtube.com/vi/{}/maxresdefault.jpg", content_id)
}

/// A normalized observation of new content from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEvent {
    pub source_id: String,
    pub content_id: String,
    pub kind: ContentKind,
    pub title: String,
    pub channel_name: String,
    pub canonical_url: String,
    pub thumbnail_url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub liveness: bool,
}

impl ContentEvent {
    /// An upload. Liveness is always false here; live detection is the status
    /// adapter's job.
    pub fn video(
        source_id: impl Into<String>,
        content_id: impl Into<String>,
        title: impl Into<String>,
        channel_name: impl Into<String>,
        thumbnail_url: Option<String>,
        published_at: Option<DateTime<Utc>>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            ContentKind::Video,
            source_id.into(),
            content_id.into(),
            title.into(),
            channel_name.into(),
            thumbnail_url,
            published_at,
            observed_at,
        )
    }

    pub fn live(
        source_id: impl Into<String>,
        content_id: impl Into<String>,
        title: impl Into<String>,
        channel_name: impl Into<String>,
        thumbnail_url: Option<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            ContentKind::Live,
            source_id.into(),
            content_id.into(),
            title.into(),
            channel_name.into(),
            thumbnail_url,
            None,
            observed_at,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        kind: ContentKind,
        source_id: String,
        content_id: String,
        title: String,
        channel_name: String,
        thumbnail_url: Option<String>,
        published_at: Option<DateTime<Utc>>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let canonical_url = watch_url(&content_id);
        let thumbnail_url = thumbnail_url
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_thumbnail(&content_id));
        Self {
            source_id,
            content_id,
            kind,
            title,
            channel_name,
            canonical_url,
            thumbnail_url,
            published_at,
            observed_at,
            liveness: kind == ContentKind::Live,
        }
    }

    /// Value of the `{content.game}` template variable.
    pub fn game(&self) -> &'static str {
        match self.kind {
            ContentKind::Live => "Live Stream",
            ContentKind::Video => "",
        }
    }

    /// True when the content was published longer than `threshold` before `now`.
    /// Events without a publish time are never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.published_at
            .is_some_and(|published| now.signed_duration_since(published) > threshold)
    }
}
