use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::event::{ContentKind, KindFilter, UnknownValue};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database file
    #[error("Database is locked by another process")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

pub(crate) fn from_unix(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

// ============================================================================
// Feed Registry
// ============================================================================

/// Raw registry row: (id, guild_id, source_reference, delivery_target,
/// kind_filter, is_enabled, template_json)
pub(crate) type FeedRow = (i64, String, String, String, String, bool, Option<String>);

/// An operator-configured binding of a source to a delivery target.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub id: i64,
    pub guild_id: String,
    /// URL, handle or canonical channel id, exactly as the operator entered it
    pub source_reference: String,
    /// Discord channel id
    pub delivery_target: String,
    pub kind_filter: KindFilter,
    pub enabled: bool,
    /// Raw template JSON, `None` when the operator never customised the message
    pub template: Option<String>,
}

/// A feed as submitted by the operator command layer.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub guild_id: String,
    pub source_reference: String,
    pub delivery_target: String,
    pub kind_filter: KindFilter,
    pub enabled: bool,
    pub template: Option<String>,
}

// ============================================================================
// Intake Queue
// ============================================================================

/// Broadcast state reported for a pushed video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeEventType {
    /// Regular upload
    None,
    Upcoming,
    Live,
}

impl IntakeEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            IntakeEventType::None => "none",
            IntakeEventType::Upcoming => "upcoming",
            IntakeEventType::Live => "live",
        }
    }

    /// The content kind to announce, `None` for scheduled streams that have not started.
    pub fn content_kind(self) -> Option<ContentKind> {
        match self {
            IntakeEventType::None => Some(ContentKind::Video),
            IntakeEventType::Live => Some(ContentKind::Live),
            IntakeEventType::Upcoming => None,
        }
    }
}

impl FromStr for IntakeEventType {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "video" => Ok(IntakeEventType::None),
            "upcoming" => Ok(IntakeEventType::Upcoming),
            "live" => Ok(IntakeEventType::Live),
            other => Err(UnknownValue(other.to_owned())),
        }
    }
}

/// Raw intake row
pub(crate) type IntakeRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    i64,
);

/// A validated push notification waiting to be processed.
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeEvent {
    pub id: i64,
    pub content_id: String,
    pub source_id: String,
    pub title: String,
    pub channel_name: String,
    pub event_type: IntakeEventType,
    pub published_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// A push notification about to be appended to the intake queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIntakeEvent {
    pub content_id: String,
    pub source_id: String,
    pub title: String,
    pub channel_name: String,
    pub event_type: IntakeEventType,
    pub published_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(UnknownValue(other.to_owned())),
        }
    }
}

/// Raw subscription row: (source_id, status, expires_at, consecutive_failures, last_attempt_at)
pub(crate) type SubscriptionRow = (String, String, Option<i64>, i64, Option<i64>);

/// A push-subscription lease with the upstream hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub source_id: String,
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Whether push notifications can currently be expected for this source.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.expires_at.is_some_and(|exp| exp > now)
    }
}

// ============================================================================
// Dedup Records
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DedupRecord {
    pub source_id: String,
    pub content_id: String,
    pub classification: ContentKind,
    pub delivered_at: DateTime<Utc>,
}
