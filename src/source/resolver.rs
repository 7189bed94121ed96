//! Turns operator-entered channel references into canonical channel ids.
//!
//! Feeds may name a channel by `/channel/UC…` URL, any URL that embeds a
//! `UC…` id, an `@handle` URL, a custom URL or a bare handle. Ids are
//! extracted directly where possible, otherwise the channel page is fetched
//! and scanned. Uses plain string scanning, no HTML parser.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use super::fetcher::{fetch_bytes, FetchError};
use super::SourceGroup;
use crate::storage::Feed;

/// Length of a canonical channel id: `UC` + 22 url-safe characters.
const CHANNEL_ID_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Not a YouTube reference at all
    #[error("unsupported channel reference: {0}")]
    Unsupported(String),
    /// Page fetched but no channel id found in it
    #[error("no channel id found for {0}")]
    NotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

fn is_id_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// A `UC…` id starting at byte `start` of `text`, if one is there.
fn channel_id_at(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let end = start.checked_add(CHANNEL_ID_LEN)?;
    let candidate = bytes.get(start..end)?;
    if !candidate.starts_with(b"UC") || !candidate.iter().all(|&b| is_id_char(b)) {
        return None;
    }
    // Must not be part of a longer token
    if bytes.get(end).is_some_and(|&b| is_id_char(b)) {
        return None;
    }
    text.get(start..end)
}

/// First id that directly follows `marker` in `text`.
fn find_after<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.match_indices(marker)
        .find_map(|(idx, _)| channel_id_at(text, idx + marker.len()))
}

/// Extracts a canonical channel id embedded in a URL or text fragment.
///
/// Prefers an explicit `channel/UC…` path, then any standalone `UC…` token.
pub fn extract_channel_id(text: &str) -> Option<String> {
    if let Some(id) = find_after(text, "channel/") {
        return Some(id.to_owned());
    }

    let bytes = text.as_bytes();
    text.match_indices("UC")
        .filter(|(idx, _)| *idx == 0 || !is_id_char(bytes[idx - 1]))
        .find_map(|(idx, _)| channel_id_at(text, idx))
        .map(str::to_owned)
}

/// Scan a fetched channel page for its id.
fn scan_page(html: &str) -> Option<String> {
    find_after(html, "\"channelId\":\"")
        .or_else(|| find_after(html, "channel/"))
        .map(str::to_owned)
}

/// Resolves channel references, caching successes for the process lifetime.
///
/// Failures are not cached, so an unresolvable reference is retried on every
/// cycle that needs it.
pub struct Resolver {
    client: reqwest::Client,
    site_base: String,
    timeout: Duration,
    cache: RwLock<HashMap<String, String>>,
}

impl Resolver {
    pub fn new(client: reqwest::Client, site_base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            site_base: site_base.into().trim_end_matches('/').to_owned(),
            timeout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The page to fetch for a reference that carries no id.
    fn page_url(&self, reference: &str) -> Result<String, ResolveError> {
        if reference.starts_with(&self.site_base) {
            return Ok(reference.to_owned());
        }

        match url::Url::parse(reference) {
            Ok(url) => {
                let host = url.host_str().unwrap_or_default();
                let is_youtube = host == "youtube.com"
                    || host.ends_with(".youtube.com")
                    || host == "youtu.be";
                if !is_youtube {
                    return Err(ResolveError::Unsupported(reference.to_owned()));
                }
                let mut page = format!("{}{}", self.site_base, url.path());
                if let Some(query) = url.query() {
                    page.push('?');
                    page.push_str(query);
                }
                Ok(page)
            }
            Err(_) => {
                let handle = reference.trim_start_matches('@');
                if handle.is_empty() || handle.contains(|c: char| c.is_whitespace() || c == '/') {
                    return Err(ResolveError::Unsupported(reference.to_owned()));
                }
                Ok(format!("{}/@{}", self.site_base, handle))
            }
        }
    }

    pub async fn resolve(&self, reference: &str) -> Result<String, ResolveError> {
        let reference = reference.trim();

        if let Some(id) = extract_channel_id(reference) {
            return Ok(id);
        }

        if let Some(id) = self.cache.read().await.get(reference) {
            return Ok(id.clone());
        }

        let page = self.page_url(reference)?;
        let bytes = fetch_bytes(self.client.get(&page), self.timeout).await?;
        let id = scan_page(&String::from_utf8_lossy(&bytes))
            .ok_or_else(|| ResolveError::NotFound(reference.to_owned()))?;

        tracing::debug!(reference = %reference, source_id = %id, "Resolved channel reference");
        self.cache
            .write()
            .await
            .insert(reference.to_owned(), id.clone());
        Ok(id)
    }

    /// Group feeds by resolved source. Feeds whose reference cannot be
    /// resolved are logged and left out of this cycle.
    pub async fn group(&self, feeds: Vec<Feed>) -> Vec<SourceGroup> {
        self.group_all(feeds).await.groups
    }

    /// Like [`Resolver::group`], also counting the references left out.
    pub async fn group_all(&self, feeds: Vec<Feed>) -> Grouping {
        let mut by_reference: BTreeMap<String, Vec<Feed>> = BTreeMap::new();
        for feed in feeds {
            by_reference
                .entry(feed.source_reference.trim().to_owned())
                .or_default()
                .push(feed);
        }

        let resolved = futures::future::join_all(by_reference.into_iter().map(
            |(reference, feeds)| async move {
                let result = self.resolve(&reference).await;
                (reference, feeds, result)
            },
        ))
        .await;

        let mut groups: BTreeMap<String, Vec<Feed>> = BTreeMap::new();
        let mut unresolved = 0;
        for (reference, feeds, result) in resolved {
            match result {
                Ok(source_id) => groups.entry(source_id).or_default().extend(feeds),
                Err(e) => {
                    unresolved += 1;
                    tracing::warn!(reference = %reference, feeds = feeds.len(), error = %e, "Could not resolve channel, skipping");
                }
            }
        }

        Grouping {
            groups: groups
                .into_iter()
                .map(|(source_id, feeds)| SourceGroup { source_id, feeds })
                .collect(),
            unresolved,
        }
    }
}

/// Result of grouping the registry by source.
#[derive(Debug, Clone, PartialEq)]
pub struct Grouping {
    pub groups: Vec<SourceGroup>,
    /// Distinct references that could not be resolved this time
    pub unresolved: usize,
}

impl Grouping {
    /// Every reference in the registry resolved.
    pub fn is_complete(&self) -> bool {
        self.unresolved == 0
    }
}
