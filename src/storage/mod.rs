//! SQLite-backed state: feed registry (read-only), dedup ledger, push intake
//! queue, subscription leases and poll cursors.

mod cursors;
mod feeds;
mod intake;
mod ledger;
mod schema;
mod subscriptions;
mod types;

pub use schema::Database;
pub use types::{
    DatabaseError, DedupRecord, Feed, IntakeEvent, IntakeEventType, NewFeed, NewIntakeEvent,
    Subscription, SubscriptionStatus,
};
