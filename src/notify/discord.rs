use lru::LruCache;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{DeliveryError, Dispatcher, Embed, Message};

/// Channels known to exist. Bounded so a churny registry cannot grow it forever.
const CHANNEL_CACHE_SIZE: usize = 512;

#[derive(Serialize)]
struct DiscordUrl<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct DiscordFooter<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_url: Option<&'a str>,
}

#[derive(Serialize)]
struct DiscordEmbed<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<DiscordUrl<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<DiscordUrl<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<DiscordFooter<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

impl<'a> From<&'a Embed> for DiscordEmbed<'a> {
    fn from(e: &'a Embed) -> Self {
        Self {
            title: e.title.as_deref(),
            description: e.description.as_deref(),
            url: e.url.as_deref(),
            color: e.color,
            image: e.image_url.as_deref().map(|url| DiscordUrl { url }),
            thumbnail: e.thumbnail_url.as_deref().map(|url| DiscordUrl { url }),
            footer: e.footer_text.as_deref().map(|text| DiscordFooter {
                text,
                icon_url: e.footer_icon_url.as_deref(),
            }),
            timestamp: e.timestamp.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
struct AllowedMentions {
    parse: Vec<&'static str>,
}

#[derive(Serialize)]
struct CreateMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    embeds: Vec<DiscordEmbed<'a>>,
    allowed_mentions: AllowedMentions,
}

impl<'a> CreateMessage<'a> {
    fn from_message(message: &'a Message) -> Self {
        let parse = if message.mention_everyone {
            vec!["everyone"]
        } else {
            Vec::new()
        };
        Self {
            content: Some(message.content.as_str()).filter(|c| !c.is_empty()),
            embeds: message.embeds.iter().map(DiscordEmbed::from).collect(),
            allowed_mentions: AllowedMentions { parse },
        }
    }
}

#[derive(serde::Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

/// Delivers messages to Discord text channels over the REST API.
pub struct DiscordDispatcher {
    client: Client,
    api_base: String,
    token: SecretString,
    timeout: Duration,
    channels: Mutex<LruCache<String, ()>>,
}

impl DiscordDispatcher {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        token: SecretString,
        timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(CHANNEL_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            token,
            timeout,
            channels: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token.expose_secret())
    }

    async fn map_failure(&self, target: &str, response: reqwest::Response) -> DeliveryError {
        match response.status() {
            StatusCode::NOT_FOUND => {
                self.channels.lock().await.pop(target);
                DeliveryError::NotFound(target.to_owned())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                DeliveryError::Forbidden(target.to_owned())
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let header = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok());
                let body = response
                    .json::<RateLimitBody>()
                    .await
                    .ok()
                    .and_then(|b| b.retry_after);
                DeliveryError::RateLimited {
                    retry_after: body.or(header),
                }
            }
            status => DeliveryError::Other(format!("HTTP {}", status.as_u16())),
        }
    }

    /// Confirm the channel exists, consulting the cache first.
    async fn resolve_channel(&self, target: &str) -> Result<(), DeliveryError> {
        if self.channels.lock().await.get(target).is_some() {
            return Ok(());
        }

        let response = self
            .client
            .get(format!("{}/channels/{}", self.api_base, target))
            .header("Authorization", self.auth())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| DeliveryError::Other(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.map_failure(target, response).await);
        }

        self.channels.lock().await.put(target.to_owned(), ());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dispatcher for DiscordDispatcher {
    async fn deliver(&self, target: &str, message: &Message) -> Result<(), DeliveryError> {
        if target.is_empty() || !target.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DeliveryError::NotFound(target.to_owned()));
        }

        self.resolve_channel(target).await?;

        let response = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, target))
            .header("Authorization", self.auth())
            .timeout(self.timeout)
            .json(&CreateMessage::from_message(message))
            .send()
            .await
            .map_err(|e| DeliveryError::Other(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.map_failure(target, response).await);
        }

        tracing::debug!(channel = %target, "Message delivered");
        Ok(())
    }
}
