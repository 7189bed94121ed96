//! Ledger → renderer → dispatcher, shared by every adapter.

use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;

use crate::event::{ContentEvent, ContentKind};
use crate::ledger::DedupLedger;
use crate::notify::{Dispatcher, Renderer};
use crate::storage::Feed;

/// What to do when an upload shows up for content first announced as live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VodPolicy {
    /// The stream and its VOD are one event
    #[default]
    Suppress,
    /// Announce the VOD once more as a video
    Notify,
}

/// Result of pushing one event through the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// This call won the ledger claim
    pub claimed: bool,
    /// Feeds whose filter accepted the event
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Feeds skipped by their kind filter or because they are disabled
    pub filtered: usize,
}

pub struct Pipeline {
    ledger: DedupLedger,
    renderer: Renderer,
    dispatcher: Arc<dyn Dispatcher>,
    vod_policy: VodPolicy,
}

impl Pipeline {
    pub fn new(
        ledger: DedupLedger,
        renderer: Renderer,
        dispatcher: Arc<dyn Dispatcher>,
        vod_policy: VodPolicy,
    ) -> Self {
        Self {
            ledger,
            renderer,
            dispatcher,
            vod_policy,
        }
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    /// Claim the event and, if this call won, deliver it to every matching feed.
    ///
    /// Delivery failures are logged per target and never undo the claim.
    /// Only ledger errors are returned.
    pub async fn process(&self, event: &ContentEvent, feeds: &[Feed]) -> Result<Outcome> {
        if !self.claim(event).await? {
            tracing::debug!(
                source_id = %event.source_id,
                content_id = %event.content_id,
                "Already delivered, skipping"
            );
            return Ok(Outcome::default());
        }

        let (accepted, rejected): (Vec<&Feed>, Vec<&Feed>) = feeds
            .iter()
            .partition(|f| f.enabled && f.kind_filter.accepts(event.kind));

        let mut outcome = Outcome {
            claimed: true,
            matched: accepted.len(),
            filtered: rejected.len(),
            ..Default::default()
        };

        let results = futures::future::join_all(accepted.iter().map(|feed| async move {
            let message = self.renderer.render(event, feed);
            (feed, self.dispatcher.deliver(&feed.delivery_target, &message).await)
        }))
        .await;

        for (feed, result) in results {
            match result {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        feed_id = feed.id,
                        delivery_target = %feed.delivery_target,
                        content_id = %event.content_id,
                        kind = e.kind(),
                        error = %e,
                        "Delivery failed"
                    );
                }
            }
        }

        tracing::info!(
            source_id = %event.source_id,
            content_id = %event.content_id,
            kind = %event.kind,
            title = %event.title,
            delivered = outcome.delivered,
            failed = outcome.failed,
            filtered = outcome.filtered,
            "New content announced"
        );

        Ok(outcome)
    }

    /// Claim without delivering: first-run baselines, stale and scheduled content.
    pub async fn mark_seen(&self, event: &ContentEvent) -> Result<bool> {
        self.ledger
            .try_claim(&event.source_id, &event.content_id, event.kind, event.observed_at)
            .await
    }

    async fn claim(&self, event: &ContentEvent) -> Result<bool> {
        let claimed = self
            .ledger
            .try_claim(&event.source_id, &event.content_id, event.kind, event.observed_at)
            .await?;
        if claimed {
            return Ok(true);
        }

        if event.kind == ContentKind::Video && self.vod_policy == VodPolicy::Notify {
            return self
                .ledger
                .try_reclassify(
                    &event.source_id,
                    &event.content_id,
                    ContentKind::Live,
                    ContentKind::Video,
                    event.observed_at,
                )
                .await;
        }

        Ok(false)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::notify::{DeliveryError, Message};
    use tokio::sync::Mutex;

    /// Records every delivery; targets listed in `missing` fail with `NotFound`.
    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub sent: Mutex<Vec<(String, Message)>>,
        pub missing: Vec<String>,
    }

    #[async_trait::async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn deliver(&self, target: &str, message: &Message) -> Result<(), DeliveryError> {
            if self.missing.iter().any(|m| m == target) {
                return Err(DeliveryError::NotFound(target.to_owned()));
            }
            self.sent
                .lock()
                .await
                .push((target.to_owned(), message.clone()));
            Ok(())
        }
    }
}
