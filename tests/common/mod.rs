//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use feedcast::event::KindFilter;
use feedcast::notify::{DeliveryError, Dispatcher, Message};
use feedcast::storage::{Database, NewFeed};
use tokio::sync::Mutex;

pub const CHANNEL: &str = "UCabcdefghijklmnopqrstuv";

pub async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

/// A database file in the temp dir, removed on drop. Unlike `:memory:`, its
/// pool holds several connections, so concurrent queries really race.
pub struct FileDb {
    pub db: Database,
    dir: PathBuf,
}

impl FileDb {
    pub async fn open(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("feedcast_{name}_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedcast.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        Self { db, dir }
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

/// Records every delivery instead of talking to Discord.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<(String, Message)>>,
}

#[async_trait::async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn deliver(&self, target: &str, message: &Message) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .await
            .push((target.to_owned(), message.clone()));
        Ok(())
    }
}

pub fn new_feed(source_reference: &str, target: &str, kind_filter: KindFilter) -> NewFeed {
    NewFeed {
        guild_id: "guild".into(),
        source_reference: source_reference.into(),
        delivery_target: target.into(),
        kind_filter,
        enabled: true,
        template: None,
    }
}

/// A channel Atom feed with the given `(video id, title, published)` entries, newest first.
pub fn atom(entries: &[(&str, &str, DateTime<Utc>)]) -> String {
    let body: String = entries
        .iter()
        .map(|(id, title, published)| {
            format!(
                r#"<entry><id>yt:video:{id}</id><title>{title}</title><link rel="alternate" href="https://www.youtube.com/watch?v={id}"/><author><name>Chan</name><uri>https://www.youtube.com/channel/{CHANNEL}</uri></author><published>{}</published></entry>"#,
                published.to_rfc3339()
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><feed xmlns="http://www.w3.org/2005/Atom"><id>yt:channel:{CHANNEL}</id><title>Chan</title>{body}</feed>"#
    )
}
