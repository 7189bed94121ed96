//! Runs every adapter on its own cadence and wires them to one pipeline.
//!
//! Four loops share the pipeline: push drain, live status, syndication poll
//! and maintenance (subscription renewal plus ledger pruning). Each loop
//! reloads the feed registry per cycle, so registry changes apply without a
//! restart. Nothing in a cycle can end its loop; only the shutdown signal does.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::redirect::Policy;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::event::ContentKind;
use crate::ledger::DedupLedger;
use crate::notify::{Dispatcher, RenderOptions, Renderer};
use crate::pipeline::Pipeline;
use crate::source::{
    CycleReport, Grouping, PushAdapter, Resolver, SourceGroup, StatusAdapter, StatusClient,
    SyndicationAdapter,
};
use crate::storage::{Database, Feed};
use crate::subscription::{HubClient, Release, RenewalPolicy, RenewalReport, SubscriptionManager};

/// Follow at most 3 redirects and refuse loops.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

/// Shared HTTP client. Per-request timeouts are applied by each caller.
pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(redirect_policy())
        .user_agent(concat!("feedcast/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()?)
}

/// Tick period of each loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub push: Duration,
    pub status: Duration,
    pub syndication: Duration,
    pub maintenance: Duration,
}

impl Cadence {
    fn from_config(config: &Config) -> Self {
        let secs = |s: u64| Duration::from_secs(s.max(1));
        Self {
            push: secs(config.push_interval_secs),
            status: secs(config.status_interval_secs),
            syndication: secs(config.syndication_interval_secs),
            maintenance: secs(config.renewal_interval_secs),
        }
    }
}

/// Reports of one pass over every adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub push: CycleReport,
    pub syndication: CycleReport,
    pub status: CycleReport,
    pub renewal: RenewalReport,
    pub pruned: u64,
}

fn wants(group: &SourceGroup, kind: ContentKind) -> bool {
    group.feeds.iter().any(|f| f.enabled && f.kind_filter.accepts(kind))
}

/// Groups with at least one feed that wants `kind`, trimmed to those feeds.
fn groups_for(groups: &[SourceGroup], kind: ContentKind) -> Vec<SourceGroup> {
    groups
        .iter()
        .filter_map(|g| {
            let feeds: Vec<Feed> = g
                .feeds
                .iter()
                .filter(|f| f.enabled && f.kind_filter.accepts(kind))
                .cloned()
                .collect();
            (!feeds.is_empty()).then(|| SourceGroup {
                source_id: g.source_id.clone(),
                feeds,
            })
        })
        .collect()
}

/// Whether a source should be polled on syndication cycle `cycle`.
/// Push-covered sources are only polled every `covered_poll_every`-th cycle.
fn should_poll(covered: bool, cycle: u64, covered_poll_every: u64) -> bool {
    !covered || cycle % covered_poll_every.max(1) == 0
}

pub struct Scheduler {
    db: Database,
    pipeline: Pipeline,
    resolver: Resolver,
    push: PushAdapter,
    syndication: SyndicationAdapter,
    status: StatusAdapter,
    subscriptions: SubscriptionManager,
    cadence: Cadence,
    covered_poll_every: u64,
    syndication_cycle: AtomicU64,
}

impl Scheduler {
    pub fn from_config(
        config: &Config,
        db: Database,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let client = http_client()?;
        let timeout = config.request_timeout();
        let staleness = config.staleness();
        let endpoints = &config.endpoints;

        let renderer = Renderer::new(RenderOptions {
            video_mention: config.video_mention,
            footer_text: config.footer_text.clone(),
        });
        let pipeline = Pipeline::new(
            DedupLedger::new(db.clone(), config.ledger_retention_days),
            renderer,
            dispatcher,
            config.vod_after_live,
        );

        let hub = match &config.hub.callback_url {
            Some(callback) => Some(HubClient::new(
                client.clone(),
                &config.hub.url,
                callback,
                config.hub.lease_seconds,
                timeout,
            )),
            None => {
                tracing::info!("No hub callback configured, running polling-only");
                None
            }
        };
        let policy = RenewalPolicy {
            lease: chrono::Duration::seconds(config.hub.lease_seconds),
            renewal_margin: chrono::Duration::hours(config.hub.renewal_margin_hours),
            max_failures: config.hub.max_failures.max(1),
            ack_timeout: chrono::Duration::minutes(config.hub.ack_timeout_minutes),
        };

        let status = StatusAdapter::new(
            StatusClient::new(client.clone(), &endpoints.data_api, config.youtube_api_key(), timeout),
            config.max_concurrency,
        );
        let syndication = SyndicationAdapter::new(
            client.clone(),
            &endpoints.youtube_feeds,
            timeout,
            staleness,
            config.max_concurrency,
        )
        .with_status(Arc::clone(status.client()));

        Ok(Self {
            resolver: Resolver::new(client, &endpoints.youtube_site, timeout),
            push: PushAdapter::new(config.push_batch_size, staleness),
            syndication,
            status,
            subscriptions: SubscriptionManager::new(db.clone(), hub, policy, config.max_concurrency),
            db,
            pipeline,
            cadence: Cadence::from_config(config),
            covered_poll_every: config.covered_poll_every.max(1),
            syndication_cycle: AtomicU64::new(0),
        })
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Active feeds grouped by canonical source. Unresolvable references are
    /// left out and retried next time.
    async fn grouping(&self) -> Result<Grouping> {
        let feeds = self.db.active_feeds().await?;
        Ok(self.resolver.group_all(feeds).await)
    }

    async fn load_grouping(&self, cycle: &str) -> Option<Grouping> {
        match self.grouping().await {
            Ok(grouping) => Some(grouping),
            Err(e) => {
                tracing::error!(cycle, error = %e, "Failed to load feed registry, skipping cycle");
                None
            }
        }
    }

    async fn load_groups(&self, cycle: &str) -> Option<Vec<SourceGroup>> {
        self.load_grouping(cycle).await.map(|g| g.groups)
    }

    pub async fn run_push(&self, now: DateTime<Utc>) -> CycleReport {
        let Some(groups) = self.load_groups("push").await else {
            return CycleReport::default();
        };
        let by_source: HashMap<String, Vec<Feed>> = groups
            .into_iter()
            .map(|g| (g.source_id, g.feeds))
            .collect();
        self.push.run_cycle(&self.db, &self.pipeline, &by_source, now).await
    }

    pub async fn run_status(&self, now: DateTime<Utc>) -> CycleReport {
        let Some(groups) = self.load_groups("status").await else {
            return CycleReport::default();
        };
        let groups = groups_for(&groups, ContentKind::Live);
        let report = self.status.run_cycle(&self.pipeline, groups, now).await;
        log_cycle("status", &report);
        report
    }

    pub async fn run_syndication(&self, now: DateTime<Utc>) -> CycleReport {
        let Some(groups) = self.load_groups("syndication").await else {
            return CycleReport::default();
        };
        let cycle = self.syndication_cycle.fetch_add(1, Ordering::Relaxed);
        let covered = self
            .subscriptions
            .covered_sources(now)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read push coverage, polling every source");
                HashSet::new()
            });

        // Every feed of a polled source stays in the group: a feed entry can
        // turn out to be a live stream.
        let groups: Vec<SourceGroup> = groups
            .into_iter()
            .filter(|g| wants(g, ContentKind::Video))
            .filter(|g| should_poll(covered.contains(&g.source_id), cycle, self.covered_poll_every))
            .collect();

        let report = self
            .syndication
            .run_cycle(&self.db, &self.pipeline, groups, now)
            .await;
        log_cycle("syndication", &report);
        report
    }

    /// Track new sources, renew due leases and prune the ledger.
    ///
    /// Leases of removed sources are only released when every registry
    /// reference resolved; otherwise a failing lookup would look like a removal.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> (RenewalReport, u64) {
        let renewal = match self.load_grouping("maintenance").await {
            Some(grouping) => {
                let complete = grouping.is_complete();
                let sources: HashSet<String> =
                    grouping.groups.into_iter().map(|g| g.source_id).collect();
                let renewed = async {
                    self.subscriptions
                        .track(sources.iter().map(String::as_str), now)
                        .await?;
                    let release = if complete {
                        Release::Missing
                    } else {
                        tracing::debug!("Some channels did not resolve, keeping every lease this pass");
                        Release::Keep
                    };
                    self.subscriptions.renew_due(&sources, release, now).await
                };
                renewed.await.unwrap_or_else(|e: anyhow::Error| {
                    tracing::error!(error = %e, "Subscription renewal failed");
                    RenewalReport::default()
                })
            }
            None => RenewalReport::default(),
        };

        let pruned = self.pipeline.ledger().prune(now).await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Ledger pruning failed");
            0
        });
        (renewal, pruned)
    }

    /// One pass of every loop. Maintenance runs first so new sources are
    /// tracked before the adapters look at coverage.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RunReport {
        let (renewal, pruned) = self.run_maintenance(now).await;
        let (push, syndication, status) = tokio::join!(
            self.run_push(now),
            self.run_syndication(now),
            self.run_status(now)
        );
        RunReport {
            push,
            syndication,
            status,
            renewal,
            pruned,
        }
    }

    /// Start one task per loop. Each finishes its in-flight cycle and exits
    /// once `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let cadence = self.cadence;
        vec![
            spawn_loop("maintenance", cadence.maintenance, shutdown.clone(), {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.run_maintenance(Utc::now()).await;
                    }
                }
            }),
            spawn_loop("push", cadence.push, shutdown.clone(), {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.run_push(Utc::now()).await;
                    }
                }
            }),
            spawn_loop("syndication", cadence.syndication, shutdown.clone(), {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.run_syndication(Utc::now()).await;
                    }
                }
            }),
            spawn_loop("status", cadence.status, shutdown, {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.run_status(Utc::now()).await;
                    }
                }
            }),
        ]
    }
}

fn log_cycle(cycle: &str, report: &CycleReport) {
    if report.checked == 0 {
        return;
    }
    tracing::info!(
        cycle,
        checked = report.checked,
        announced = report.announced,
        delivered = report.delivered,
        failed_deliveries = report.failed_deliveries,
        errors = report.errors,
        aborted = report.aborted,
        "Cycle complete"
    );
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(loop_name = name, period_secs = period.as_secs(), "Loop started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = interval.tick() => {
                    cycle().await;
                }
            }
        }
        tracing::debug!(loop_name = name, "Loop stopped");
    })
}
