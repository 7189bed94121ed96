//! Configuration file parser for `feedcast.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos. Secrets may also come from the environment,
//! which takes precedence over the file.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::VodPolicy;
use crate::util::validate_url;

/// Environment variable holding the Data API key.
pub const YOUTUBE_API_KEY_ENV: &str = "YOUTUBE_API_KEY";
/// Environment variable holding the Discord bot token.
pub const DISCORD_TOKEN_ENV: &str = "DISCORD_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Value parsed but makes no sense.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Secrets are masked in the `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Push intake drain cadence.
    pub push_interval_secs: u64,
    /// Live status check cadence.
    pub status_interval_secs: u64,
    /// Syndication poll cadence.
    pub syndication_interval_secs: u64,
    /// Subscription renewal and ledger pruning cadence.
    pub renewal_interval_secs: u64,

    /// Timeout for every outbound request.
    pub request_timeout_secs: u64,
    /// Content published longer ago than this is never announced.
    pub staleness_hours: u64,
    /// Sources with push coverage are polled only every Nth syndication cycle.
    pub covered_poll_every: u64,
    /// Sources checked concurrently within one cycle.
    pub max_concurrency: usize,
    /// Intake records fetched per batch.
    pub push_batch_size: usize,

    /// Dedup records older than this are pruned. 0 keeps them forever.
    pub ledger_retention_days: u32,
    /// Whether a VOD of an announced stream gets its own notification.
    pub vod_after_live: VodPolicy,
    /// Mention `@everyone` on default video notifications too.
    pub video_mention: bool,
    /// Footer of the default embed.
    pub footer_text: String,

    /// Data API key (alternative to YOUTUBE_API_KEY env var).
    pub youtube_api_key: Option<String>,
    /// Discord bot token (alternative to DISCORD_TOKEN env var).
    pub discord_token: Option<String>,

    pub hub: HubConfig,
    pub endpoints: Endpoints,
}

/// WebSub hub settings. Push is disabled without a `callback_url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub url: String,
    /// Public URL of the webhook receiver
    pub callback_url: Option<String>,
    pub lease_seconds: i64,
    pub renewal_margin_hours: i64,
    pub max_failures: i64,
    pub ack_timeout_minutes: i64,
}

/// Upstream base URLs. Overridable so tests can point them at a mock server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub youtube_site: String,
    pub youtube_feeds: String,
    pub data_api: String,
    pub discord_api: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            push_interval_secs: 30,
            status_interval_secs: 60,
            syndication_interval_secs: 240,
            renewal_interval_secs: 3600,
            request_timeout_secs: 10,
            staleness_hours: 24,
            covered_poll_every: 4,
            max_concurrency: 8,
            push_batch_size: 50,
            ledger_retention_days: 90,
            vod_after_live: VodPolicy::Suppress,
            video_mention: false,
            footer_text: "YouTube Notifications".to_string(),
            youtube_api_key: None,
            discord_token: None,
            hub: HubConfig::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "https://pubsubhubbub.appspot.com/subscribe".to_string(),
            callback_url: None,
            lease_seconds: 432_000,
            renewal_margin_hours: 12,
            max_failures: 3,
            ack_timeout_minutes: 30,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            youtube_site: "https://www.youtube.com".to_string(),
            youtube_feeds: "https://www.youtube.com".to_string(),
            data_api: "https://www.googleapis.com/youtube/v3".to_string(),
            discord_api: "https://discord.com/api/v10".to_string(),
        }
    }
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "[REDACTED]")
}

/// Mask secrets in Debug output to prevent leakage into logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("push_interval_secs", &self.push_interval_secs)
            .field("status_interval_secs", &self.status_interval_secs)
            .field("syndication_interval_secs", &self.syndication_interval_secs)
            .field("renewal_interval_secs", &self.renewal_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("staleness_hours", &self.staleness_hours)
            .field("covered_poll_every", &self.covered_poll_every)
            .field("max_concurrency", &self.max_concurrency)
            .field("push_batch_size", &self.push_batch_size)
            .field("ledger_retention_days", &self.ledger_retention_days)
            .field("vod_after_live", &self.vod_after_live)
            .field("video_mention", &self.video_mention)
            .field("footer_text", &self.footer_text)
            .field("youtube_api_key", &redact(&self.youtube_api_key))
            .field("discord_token", &redact(&self.discord_token))
            .field("hub", &self.hub)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Non-public or non-http `hub.callback_url` → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            push = config.hub.callback_url.is_some(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Check values that would otherwise fail at runtime.
    ///
    /// Time spans are bounded to a century so date arithmetic on them
    /// cannot overflow.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(callback) = &self.hub.callback_url {
            validate_url(callback)
                .map_err(|e| ConfigError::Invalid(format!("hub.callback_url: {e}")))?;
        }
        if self.covered_poll_every == 0 {
            return Err(ConfigError::Invalid("covered_poll_every must be at least 1".into()));
        }

        let spans = [
            ("hub.lease_seconds", self.hub.lease_seconds, 1, MAX_SPAN_DAYS * 86_400),
            ("hub.renewal_margin_hours", self.hub.renewal_margin_hours, 0, MAX_SPAN_DAYS * 24),
            ("hub.ack_timeout_minutes", self.hub.ack_timeout_minutes, 0, MAX_SPAN_DAYS * 1_440),
            ("ledger_retention_days", i64::from(self.ledger_retention_days), 0, MAX_SPAN_DAYS),
        ];
        for (key, value, min, max) in spans {
            if !(min..=max).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be between {min} and {max}, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Let environment variables override secrets from the file.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(YOUTUBE_API_KEY_ENV) {
            self.youtube_api_key = Some(key);
        }
        if let Some(token) = non_empty(DISCORD_TOKEN_ENV) {
            self.discord_token = Some(token);
        }
    }

    pub fn youtube_api_key(&self) -> Option<SecretString> {
        self.youtube_api_key.clone().map(SecretString::from)
    }

    pub fn discord_token(&self) -> Option<SecretString> {
        self.discord_token.clone().map(SecretString::from)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn staleness(&self) -> chrono::Duration {
        // capped at a century to stay inside chrono's range
        let hours = self.staleness_hours.min(24 * 365 * 100);
        chrono::Duration::hours(i64::try_from(hours).unwrap_or_default())
    }
}

/// Upper bound on any configured time span.
const MAX_SPAN_DAYS: i64 = 365 * 100;

fn warn_unknown_keys(raw: &toml::Table) {
    const KNOWN: &[&str] = &[
        "push_interval_secs",
        "status_interval_secs",
        "syndication_interval_secs",
        "renewal_interval_secs",
        "request_timeout_secs",
        "staleness_hours",
        "covered_poll_every",
        "max_concurrency",
        "push_batch_size",
        "ledger_retention_days",
        "vod_after_live",
        "video_mention",
        "footer_text",
        "youtube_api_key",
        "discord_token",
        "hub",
        "endpoints",
    ];
    const KNOWN_HUB: &[&str] = &[
        "url",
        "callback_url",
        "lease_seconds",
        "renewal_margin_hours",
        "max_failures",
        "ack_timeout_minutes",
    ];
    const KNOWN_ENDPOINTS: &[&str] = &["youtube_site", "youtube_feeds", "data_api", "discord_api"];

    for (key, value) in raw {
        if !KNOWN.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        let nested = match key.as_str() {
            "hub" => KNOWN_HUB,
            "endpoints" => KNOWN_ENDPOINTS,
            _ => continue,
        };
        if let Some(table) = value.as_table() {
            for sub in table.keys() {
                if !nested.contains(&sub.as_str()) {
                    tracing::warn!(key = %format!("{key}.{sub}"), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
