//! Atom parsing for channel syndication feeds and hub push payloads.

use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed};
use feed_rs::parser;

use super::fetcher::FetchError;
use super::resolver::extract_channel_id;
use crate::storage::{IntakeEventType, NewIntakeEvent};
use crate::util::strip_control_chars;

/// The newest upload in a channel's syndication document.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub content_id: String,
    pub title: String,
    pub channel_name: String,
    pub published_at: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
}

fn parse(bytes: &[u8]) -> Result<Feed, FetchError> {
    parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))
}

/// `yt:video:ID` entry ids, falling back to a `watch?v=ID` link.
fn video_id(entry: &Entry) -> Option<String> {
    if let Some(id) = entry.id.trim().strip_prefix("yt:video:") {
        if !id.is_empty() {
            return Some(id.to_owned());
        }
    }

    entry.links.iter().find_map(|link| {
        let url = url::Url::parse(&link.href).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    })
}

fn text(t: Option<feed_rs::model::Text>) -> Option<String> {
    t.map(|t| strip_control_chars(t.content.trim()).into_owned())
        .filter(|s| !s.is_empty())
}

fn thumbnail(entry: &Entry) -> Option<String> {
    entry
        .media
        .iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| t.image.uri.clone())
        .find(|uri| !uri.trim().is_empty())
}

fn author_name(entry: &Entry) -> Option<String> {
    entry
        .authors
        .iter()
        .map(|a| strip_control_chars(a.name.trim()).into_owned())
        .find(|n| !n.is_empty())
}

/// Parse a syndication document and return its newest entry.
///
/// Documents list entries newest first; only the first entry with a
/// recognisable video id is considered. `Ok(None)` for an empty document.
pub fn newest_entry(bytes: &[u8]) -> Result<Option<FeedEntry>, FetchError> {
    let feed = parse(bytes)?;
    let feed_title = text(feed.title);

    let Some(entry) = feed.entries.into_iter().find(|e| video_id(e).is_some()) else {
        return Ok(None);
    };

    let Some(content_id) = video_id(&entry) else {
        return Ok(None);
    };
    let thumbnail_url = thumbnail(&entry);
    let channel_name = feed_title
        .or_else(|| author_name(&entry))
        .unwrap_or_else(|| "Unknown Channel".to_owned());

    Ok(Some(FeedEntry {
        content_id,
        title: text(entry.title).unwrap_or_else(|| "Unknown Title".to_owned()),
        channel_name,
        published_at: entry.published.or(entry.updated),
        thumbnail_url,
    }))
}

/// Parse a hub notification body into an intake candidate.
///
/// Returns `Ok(None)` for deleted-entry notifications and for payloads that
/// carry no recognisable video or channel. The broadcast state is unknown at
/// this point and defaults to a plain upload; the receiver may refine it with
/// [`crate::source::StatusClient::broadcast_status`] before enqueueing.
pub fn parse_push_payload(bytes: &[u8]) -> Result<Option<NewIntakeEvent>, FetchError> {
    if String::from_utf8_lossy(bytes).contains("deleted-entry") {
        return Ok(None);
    }

    let feed = parse(bytes)?;
    let Some(entry) = feed.entries.into_iter().next() else {
        return Ok(None);
    };
    let Some(content_id) = video_id(&entry) else {
        return Ok(None);
    };

    let source_id = entry
        .authors
        .iter()
        .filter_map(|a| a.uri.as_deref())
        .chain(entry.links.iter().map(|l| l.href.as_str()))
        .chain(feed.links.iter().map(|l| l.href.as_str()))
        .find_map(extract_channel_id);
    let Some(source_id) = source_id else {
        return Ok(None);
    };

    let channel_name = author_name(&entry).unwrap_or_default();
    Ok(Some(NewIntakeEvent {
        content_id,
        source_id,
        title: text(entry.title).unwrap_or_default(),
        channel_name,
        event_type: IntakeEventType::None,
        published_at: entry.published.or(entry.updated),
    }))
}
