//! Content source adapters.
//!
//! Three independent signal paths observe the same channels:
//!
//! - [`push`] drains hub notifications that the webhook receiver queued
//! - [`syndication`] polls each channel's Atom feed for its newest upload
//! - [`status`] asks the Data API whether a channel is live right now
//!
//! They race freely; the dedup ledger decides which observation wins.

mod fetcher;
mod parser;
pub mod push;
mod resolver;
pub mod status;
pub mod syndication;

pub use fetcher::{fetch_bytes, FetchError, MAX_DOCUMENT_SIZE};
pub use parser::{newest_entry, parse_push_payload, FeedEntry};
pub use push::PushAdapter;
pub use resolver::{extract_channel_id, Grouping, ResolveError, Resolver};
pub use status::{LiveStream, LiveTracker, LiveTransition, StatusAdapter, StatusClient};
pub use syndication::{PollOutcome, SyndicationAdapter};

use crate::pipeline::Outcome;
use crate::storage::Feed;

/// Feeds that share one canonical source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceGroup {
    pub source_id: String,
    pub feeds: Vec<Feed>,
}

/// Tally of one adapter cycle, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    /// Events that won the ledger claim
    pub announced: usize,
    pub delivered: usize,
    pub failed_deliveries: usize,
    pub errors: usize,
    /// Quota or auth failure cut the cycle short
    pub aborted: bool,
}

impl CycleReport {
    pub(crate) fn record(&mut self, outcome: &Outcome) {
        if outcome.claimed {
            self.announced += 1;
        }
        self.delivered += outcome.delivered;
        self.failed_deliveries += outcome.failed;
    }
}
