//! Builds chat messages from content events and feed templates.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::template::{substitute, EmbedTemplate, Template, Variables, DEFAULT_COLOR};
use crate::event::{ContentEvent, ContentKind};
use crate::storage::Feed;
use crate::util::{truncate_chars, validate_url};

pub const MAX_CONTENT_CHARS: usize = 2000;
pub const MAX_TITLE_CHARS: usize = 256;
pub const MAX_DESCRIPTION_CHARS: usize = 4096;
pub const MAX_FOOTER_CHARS: usize = 2048;

/// A rich block attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer_icon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A rendered notification, ready for a [`super::Dispatcher`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Message {
    pub content: String,
    pub embeds: Vec<Embed>,
    /// Whether the message may ping `@everyone`/`@here`. Dispatchers only
    /// allow the ping when this is set. Decided by the template text, never by
    /// substituted upstream values.
    pub mention_everyone: bool,
}

/// Whether operator-written text asks for a channel-wide ping.
fn pings_everyone(text: &str) -> bool {
    text.contains("@everyone") || text.contains("@here")
}

impl Message {
    fn new(content: String, embeds: Vec<Embed>, mention_everyone: bool) -> Self {
        let content = truncate_chars(&content, MAX_CONTENT_CHARS).into_owned();
        Self {
            content,
            embeds,
            mention_everyone,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.embeds.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Ping `@everyone` on default video messages too
    pub video_mention: bool,
    /// Footer of default messages
    pub footer_text: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            video_mention: false,
            footer_text: "YouTube Notifications".to_owned(),
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn clip(s: Option<String>, max: usize) -> Option<String> {
    s.map(|s| truncate_chars(&s, max).into_owned())
}

/// Keep a template-supplied URL only if it is a public http(s) link.
fn public_url(candidate: String, field: &'static str) -> Option<String> {
    let candidate = non_empty(candidate)?;
    match validate_url(&candidate) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            tracing::debug!(field, url = %candidate, error = %e, "Dropping template URL");
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Renderer {
    options: RenderOptions,
}

impl Renderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    /// Render `event` for `feed`.
    ///
    /// Never fails: a missing, empty or invalid template falls back to the
    /// default message for the event kind.
    pub fn render(&self, event: &ContentEvent, feed: &Feed) -> Message {
        let Some(raw) = feed.template.as_deref().filter(|t| !t.trim().is_empty()) else {
            return self.render_default(event);
        };

        match Template::parse(raw) {
            Ok(template) => {
                let message = self.render_template(&template, event, feed.id);
                if message.is_empty() {
                    tracing::warn!(feed_id = feed.id, "Template rendered nothing, using default message");
                    return self.render_default(event);
                }
                message
            }
            Err(e) => {
                tracing::warn!(feed_id = feed.id, error = %e, "Invalid template, using default message");
                self.render_default(event)
            }
        }
    }

    /// Content plus every embed that builds. A failing embed is logged and dropped.
    pub fn render_template(&self, template: &Template, event: &ContentEvent, feed_id: i64) -> Message {
        let vars = Variables::from_event(event);
        let raw_content = template.message_content.as_deref().unwrap_or_default();
        let content = substitute(raw_content, &vars);

        let embeds = template
            .embeds
            .iter()
            .enumerate()
            .filter_map(|(index, raw)| {
                match EmbedTemplate::from_value(raw).and_then(|block| build_embed(&block, event, &vars)) {
                    Ok(embed) => Some(embed),
                    Err(e) => {
                        tracing::warn!(feed_id, embed = index, error = %e, "Skipping embed");
                        None
                    }
                }
            })
            .collect();

        Message::new(content, embeds, pings_everyone(raw_content))
    }

    pub fn render_default(&self, event: &ContentEvent) -> Message {
        let name = &event.channel_name;
        let mention_everyone = match event.kind {
            ContentKind::Live => true,
            ContentKind::Video => self.options.video_mention,
        };
        let (content, title, description) = match event.kind {
            ContentKind::Live => (
                format!("🔴 **LIVE NOW!** @everyone, **{name}** is live streaming!"),
                format!("🔴 {name} is LIVE!"),
                format!(
                    "**{name}** is **LIVE** right now!\n\n**[{}]({})**\n\n> Don't miss it! 🔥",
                    event.title, event.canonical_url
                ),
            ),
            ContentKind::Video => {
                let ping = if mention_everyone {
                    " @everyone,"
                } else {
                    ""
                };
                (
                    format!("📹 **NEW VIDEO!**{ping} **{name}** just uploaded a new video!"),
                    "📹 New YouTube Video!".to_owned(),
                    format!(
                        "**{name}** just uploaded a new video!\n\n**[{}]({})**\n\n> Go watch it now! 🎬",
                        event.title, event.canonical_url
                    ),
                )
            }
        };

        let embed = Embed {
            title: clip(Some(title), MAX_TITLE_CHARS),
            description: clip(Some(description), MAX_DESCRIPTION_CHARS),
            url: Some(event.canonical_url.clone()),
            color: DEFAULT_COLOR,
            image_url: non_empty(event.thumbnail_url.clone()),
            thumbnail_url: None,
            footer_text: clip(non_empty(self.options.footer_text.clone()), MAX_FOOTER_CHARS),
            footer_icon_url: None,
            timestamp: Some(event.observed_at),
        };

        Message::new(content, vec![embed], mention_everyone)
    }
}

fn build_embed(
    block: &EmbedTemplate,
    event: &ContentEvent,
    vars: &Variables<'_>,
) -> Result<Embed, super::template::BlockError> {
    let color = block.color()?;
    let render = |field: &Option<String>| field.as_deref().map(|t| substitute(t, vars)).unwrap_or_default();

    let footer_text = clip(non_empty(render(&block.footer_text)), MAX_FOOTER_CHARS);
    let footer_icon_url = footer_text
        .as_ref()
        .and_then(|_| public_url(render(&block.footer_icon_url), "footer_icon_url"));

    Ok(Embed {
        title: clip(non_empty(render(&block.title)), MAX_TITLE_CHARS),
        description: clip(non_empty(render(&block.description)), MAX_DESCRIPTION_CHARS),
        url: public_url(render(&block.url), "url").or_else(|| Some(event.canonical_url.clone())),
        color,
        image_url: public_url(render(&block.image_url), "image_url"),
        thumbnail_url: public_url(render(&block.thumbnail_url), "thumbnail_url"),
        footer_text,
        footer_icon_url,
        timestamp: None,
    })
}
