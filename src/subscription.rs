//! Push-subscription leases with the WebSub hub.
//!
//! Per source: `pending` until the hub acknowledges, `active` while the lease
//! runs, renewed inside the renewal margin, `expired` after too many failed
//! attempts in a row. Expired sources keep being retried; meanwhile the
//! syndication poll covers them every cycle.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use std::collections::HashSet;
use thiserror::Error;

use crate::source::extract_channel_id;
use crate::storage::{Database, Subscription, SubscriptionStatus};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Hub request timed out")]
    Timeout,
    #[error("Hub rejected request with status {0}")]
    Rejected(u16),
}

/// Positive hub responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubAck {
    /// 202: verification will arrive on the callback
    Accepted,
    /// 204: verified synchronously
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    fn as_str(self) -> &'static str {
        match self {
            HubMode::Subscribe => "subscribe",
            HubMode::Unsubscribe => "unsubscribe",
        }
    }
}

pub struct HubClient {
    client: reqwest::Client,
    hub_url: String,
    callback_url: String,
    lease_seconds: i64,
    timeout: std::time::Duration,
}

impl HubClient {
    pub fn new(
        client: reqwest::Client,
        hub_url: impl Into<String>,
        callback_url: impl Into<String>,
        lease_seconds: i64,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            client,
            hub_url: hub_url.into(),
            callback_url: callback_url.into(),
            lease_seconds,
            timeout,
        }
    }

    pub fn topic_url(source_id: &str) -> String {
        format!("https://www.youtube.com/xml/feeds/videos.xml?channel_id={source_id}")
    }

    pub fn lease(&self) -> Duration {
        Duration::seconds(self.lease_seconds)
    }

    pub async fn subscribe(&self, source_id: &str) -> Result<HubAck, HubError> {
        self.send(HubMode::Subscribe, source_id).await
    }

    pub async fn unsubscribe(&self, source_id: &str) -> Result<HubAck, HubError> {
        self.send(HubMode::Unsubscribe, source_id).await
    }

    async fn send(&self, mode: HubMode, source_id: &str) -> Result<HubAck, HubError> {
        let topic = Self::topic_url(source_id);
        let lease = self.lease_seconds.to_string();
        let form = [
            ("hub.callback", self.callback_url.as_str()),
            ("hub.topic", topic.as_str()),
            ("hub.verify", "async"),
            ("hub.mode", mode.as_str()),
            ("hub.lease_seconds", lease.as_str()),
        ];

        let response = tokio::time::timeout(
            self.timeout,
            self.client.post(&self.hub_url).form(&form).send(),
        )
        .await
        .map_err(|_| HubError::Timeout)??;

        match response.status() {
            StatusCode::ACCEPTED => Ok(HubAck::Accepted),
            StatusCode::NO_CONTENT => Ok(HubAck::Verified),
            status => Err(HubError::Rejected(status.as_u16())),
        }
    }
}

/// Lease timing and failure tolerance.
#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    pub lease: Duration,
    /// Renew once the lease has less than this left
    pub renewal_margin: Duration,
    /// Failed attempts in a row before a lease counts as expired
    pub max_failures: i64,
    /// Minimum gap between attempts for the same source
    pub ack_timeout: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            lease: Duration::days(5),
            renewal_margin: Duration::hours(12),
            max_failures: 3,
            ack_timeout: Duration::minutes(30),
        }
    }
}

/// Whether `sub` should get a subscribe request now.
pub fn needs_attempt(sub: &Subscription, now: DateTime<Utc>, policy: &RenewalPolicy) -> bool {
    if sub
        .last_attempt_at
        .is_some_and(|at| now.signed_duration_since(at) < policy.ack_timeout)
    {
        return false;
    }
    match sub.status {
        SubscriptionStatus::Pending | SubscriptionStatus::Expired => true,
        SubscriptionStatus::Active => sub
            .expires_at
            .is_none_or(|exp| exp - policy.renewal_margin <= now),
    }
}

/// Lease after a subscribe attempt. `attempt` is `None` when the hub did not
/// acknowledge (error status or timeout).
pub fn next_state(
    current: &Subscription,
    attempt: Option<HubAck>,
    now: DateTime<Utc>,
    policy: &RenewalPolicy,
) -> Subscription {
    let mut next = Subscription {
        last_attempt_at: Some(now),
        ..current.clone()
    };

    match attempt {
        Some(HubAck::Verified) => {
            next.status = SubscriptionStatus::Active;
            next.expires_at = Some(now + policy.lease);
            next.consecutive_failures = 0;
        }
        Some(HubAck::Accepted) => {
            // an active lease stays active until the callback extends it
            if current.status != SubscriptionStatus::Active {
                next.status = SubscriptionStatus::Pending;
            }
            next.consecutive_failures = 0;
        }
        None => {
            next.consecutive_failures = current.consecutive_failures + 1;
            if next.consecutive_failures >= policy.max_failures {
                next.status = SubscriptionStatus::Expired;
            }
        }
    }
    next
}

/// What a renewal pass does with leases whose source is not in its set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The set is the whole registry: unsubscribe the rest
    Missing,
    /// The set may be partial: leave other leases alone
    Keep,
}

/// What a renewal pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalReport {
    pub attempted: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub expired: usize,
    pub released: usize,
}

pub struct SubscriptionManager {
    db: Database,
    hub: Option<HubClient>,
    policy: RenewalPolicy,
    max_concurrency: usize,
}

impl SubscriptionManager {
    /// `hub == None` runs polling-only: nothing is tracked and no source counts
    /// as covered.
    pub fn new(
        db: Database,
        hub: Option<HubClient>,
        policy: RenewalPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            db,
            hub,
            policy,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.hub.is_some()
    }

    /// Record newly seen sources as `pending`. Only canonical ids are
    /// tracked; handles must be resolved first. Returns how many were new.
    pub async fn track<'a>(
        &self,
        source_ids: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let mut added = 0;
        for source_id in source_ids {
            if extract_channel_id(source_id).as_deref() != Some(source_id) {
                tracing::debug!(source_id = %source_id, "Not a canonical channel id, not subscribing");
                continue;
            }
            if self.db.insert_pending_subscription(source_id, now).await? {
                tracing::info!(source_id = %source_id, "Tracking new push subscription");
                added += 1;
            }
        }
        Ok(added)
    }

    /// Subscribe or renew every lease in `sources` that is due.
    ///
    /// With [`Release::Missing`], leases for sources not in `sources` are
    /// unsubscribed and forgotten.
    pub async fn renew_due(
        &self,
        sources: &HashSet<String>,
        release: Release,
        now: DateTime<Utc>,
    ) -> Result<RenewalReport> {
        let Some(hub) = &self.hub else {
            return Ok(RenewalReport::default());
        };
        let mut report = RenewalReport::default();

        let (current, stale): (Vec<Subscription>, Vec<Subscription>) = self
            .db
            .subscriptions()
            .await?
            .into_iter()
            .partition(|s| sources.contains(&s.source_id));

        let stale = match release {
            Release::Missing => stale,
            Release::Keep => Vec::new(),
        };
        for sub in stale {
            if let Err(e) = hub.unsubscribe(&sub.source_id).await {
                tracing::debug!(source_id = %sub.source_id, error = %e, "Unsubscribe failed, forgetting lease anyway");
            }
            if self.db.delete_subscription(&sub.source_id).await? {
                tracing::info!(source_id = %sub.source_id, "Released push subscription for removed source");
                report.released += 1;
            }
        }

        let due: Vec<Subscription> = current
            .into_iter()
            .filter(|s| needs_attempt(s, now, &self.policy))
            .collect();

        let results: Vec<(Subscription, Result<HubAck, HubError>)> = stream::iter(due)
            .map(|sub| async move {
                let result = hub.subscribe(&sub.source_id).await;
                (sub, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (sub, result) in results {
            report.attempted += 1;
            let ack = match result {
                Ok(ack) => {
                    report.acknowledged += 1;
                    tracing::debug!(source_id = %sub.source_id, ack = ?ack, "Hub acknowledged subscription");
                    Some(ack)
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        source_id = %sub.source_id,
                        failures = sub.consecutive_failures + 1,
                        error = %e,
                        "Hub subscription failed"
                    );
                    None
                }
            };

            let next = next_state(&sub, ack, now, &self.policy);
            if next.status == SubscriptionStatus::Expired && sub.status != SubscriptionStatus::Expired {
                report.expired += 1;
                tracing::warn!(source_id = %sub.source_id, "Push subscription expired, falling back to polling");
            }
            self.db.save_subscription(&next, now).await?;
        }

        if report.attempted > 0 || report.released > 0 {
            tracing::info!(
                attempted = report.attempted,
                acknowledged = report.acknowledged,
                failed = report.failed,
                released = report.released,
                "Subscription renewal pass complete"
            );
        }
        Ok(report)
    }

    /// Sources with a live push lease right now.
    pub async fn covered_sources(&self, now: DateTime<Utc>) -> Result<HashSet<String>> {
        if !self.is_enabled() {
            return Ok(HashSet::new());
        }
        Ok(self
            .db
            .subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.covers(now))
            .map(|s| s.source_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SOURCE: &str = "UCabcdefghijklmnopqrstuv";

    fn sub(status: SubscriptionStatus) -> Subscription {
        Subscription {
            source_id: SOURCE.into(),
            status,
            expires_at: None,
            consecutive_failures: 0,
            last_attempt_at: None,
        }
    }

    fn hub(server: &MockServer) -> HubClient {
        HubClient::new(
            reqwest::Client::new(),
            format!("{}/subscribe", server.uri()),
            "https://example.com/hook",
            432_000,
            std::time::Duration::from_secs(5),
        )
    }

    async fn mount_hub(server: &MockServer, status: u16) {
        server.reset().await;
        Mock::given(method("POST"))
            .and(path("/subscribe"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    async fn manager(server: &MockServer) -> SubscriptionManager {
        let db = Database::open(":memory:").await.unwrap();
        SubscriptionManager::new(db, Some(hub(server)), RenewalPolicy::default(), 4)
    }

    #[test]
    fn test_verified_activates() {
        let now = Utc::now();
        let policy = RenewalPolicy::default();
        let next = next_state(&sub(SubscriptionStatus::Pending), Some(HubAck::Verified), now, &policy);
        assert_eq!(next.status, SubscriptionStatus::Active);
        assert_eq!(next.expires_at, Some(now + Duration::days(5)));
        assert_eq!(next.last_attempt_at, Some(now));
    }

    #[test]
    fn test_accepted_keeps_active_lease() {
        let now = Utc::now();
        let policy = RenewalPolicy::default();
        let mut active = sub(SubscriptionStatus::Active);
        active.expires_at = Some(now + Duration::hours(2));

        let next = next_state(&active, Some(HubAck::Accepted), now, &policy);
        assert_eq!(next.status, SubscriptionStatus::Active);
        assert_eq!(next.expires_at, active.expires_at);

        let next = next_state(&sub(SubscriptionStatus::Expired), Some(HubAck::Accepted), now, &policy);
        assert_eq!(next.status, SubscriptionStatus::Pending);
        assert_eq!(next.consecutive_failures, 0);
    }

    #[test]
    fn test_repeated_failure_expires() {
        let now = Utc::now();
        let policy = RenewalPolicy::default();
        let mut current = sub(SubscriptionStatus::Active);
        for _ in 0..2 {
            current = next_state(&current, None, now, &policy);
            assert_eq!(current.status, SubscriptionStatus::Active);
        }
        current = next_state(&current, None, now, &policy);
        assert_eq!(current.status, SubscriptionStatus::Expired);
        assert_eq!(current.consecutive_failures, 3);
    }

    #[test]
    fn test_needs_attempt() {
        let now = Utc::now();
        let policy = RenewalPolicy::default();

        assert!(needs_attempt(&sub(SubscriptionStatus::Pending), now, &policy));
        assert!(needs_attempt(&sub(SubscriptionStatus::Expired), now, &policy));

        let mut active = sub(SubscriptionStatus::Active);
        active.expires_at = Some(now + Duration::days(4));
        assert!(!needs_attempt(&active, now, &policy));
        active.expires_at = Some(now + Duration::hours(11));
        assert!(needs_attempt(&active, now, &policy));

        // recently attempted: wait for the acknowledgement window
        let mut pending = sub(SubscriptionStatus::Pending);
        pending.last_attempt_at = Some(now - Duration::minutes(5));
        assert!(!needs_attempt(&pending, now, &policy));
        pending.last_attempt_at = Some(now - Duration::hours(1));
        assert!(needs_attempt(&pending, now, &policy));
    }

    #[tokio::test]
    async fn test_hub_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/subscribe"))
            .and(body_string_contains("hub.mode=subscribe"))
            .and(body_string_contains("hub.verify=async"))
            .and(body_string_contains("hub.lease_seconds=432000"))
            .and(body_string_contains("channel_id%3DUCabcdefghijklmnopqrstuv"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(hub(&server).subscribe(SOURCE).await.unwrap(), HubAck::Accepted);
    }

    #[tokio::test]
    async fn test_hub_narrow_success_codes() {
        let server = MockServer::start().await;
        mount_hub(&server, 200).await;
        assert!(matches!(
            hub(&server).subscribe(SOURCE).await,
            Err(HubError::Rejected(200))
        ));
        mount_hub(&server, 204).await;
        assert_eq!(hub(&server).subscribe(SOURCE).await.unwrap(), HubAck::Verified);
    }

    #[tokio::test]
    async fn test_track_skips_handles_and_duplicates() {
        let server = MockServer::start().await;
        let m = manager(&server).await;
        let now = Utc::now();
        assert_eq!(m.track([SOURCE, "@somebody", SOURCE], now).await.unwrap(), 1);
        assert_eq!(m.track([SOURCE], now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_renewal_lifecycle() {
        let server = MockServer::start().await;
        let m = manager(&server).await;
        let now = Utc::now();
        let sources = HashSet::from([SOURCE.to_owned()]);
        m.track([SOURCE], now).await.unwrap();

        mount_hub(&server, 204).await;
        let report = m.renew_due(&sources, Release::Missing, now).await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(m.covered_sources(now).await.unwrap(), sources);

        // not due again until the renewal margin
        let report = m
            .renew_due(&sources, Release::Missing, now + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);

        // hub down through the margin: lease expires after three failures
        mount_hub(&server, 500).await;
        let mut at = now + Duration::days(5) - Duration::hours(11);
        for _ in 0..3 {
            m.renew_due(&sources, Release::Missing, at).await.unwrap();
            at += Duration::hours(1);
        }
        let stored = m.db.subscription(SOURCE).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);
        assert!(m.covered_sources(at).await.unwrap().is_empty());

        // expired sources are retried and recover
        mount_hub(&server, 204).await;
        m.renew_due(&sources, Release::Missing, at).await.unwrap();
        assert_eq!(m.covered_sources(at).await.unwrap(), sources);
    }

    #[tokio::test]
    async fn test_removed_source_released() {
        let server = MockServer::start().await;
        mount_hub(&server, 202).await;
        let m = manager(&server).await;
        let now = Utc::now();
        m.track([SOURCE], now).await.unwrap();

        let report = m.renew_due(&HashSet::new(), Release::Missing, now).await.unwrap();
        assert_eq!(report.released, 1);
        assert!(m.db.subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_source_set_keeps_leases() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;
        let m = manager(&server).await;
        let now = Utc::now();
        m.track([SOURCE], now).await.unwrap();

        let report = m.renew_due(&HashSet::new(), Release::Keep, now).await.unwrap();
        assert_eq!(report, RenewalReport::default());
        assert_eq!(m.db.subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_without_hub() {
        let db = Database::open(":memory:").await.unwrap();
        let m = SubscriptionManager::new(db, None, RenewalPolicy::default(), 4);
        let now = Utc::now();
        assert_eq!(m.track([SOURCE], now).await.unwrap(), 0);
        assert_eq!(
            m.renew_due(&HashSet::from([SOURCE.to_owned()]), Release::Missing, now)
                .await
                .unwrap(),
            RenewalReport::default()
        );
        assert!(m.covered_sources(now).await.unwrap().is_empty());
    }
}
