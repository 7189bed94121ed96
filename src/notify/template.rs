//! Operator message templates and `{variable}` substitution.

use serde::Deserialize;
use thiserror::Error;

use crate::event::ContentEvent;

/// Colour used when a template block does not specify one.
pub const DEFAULT_COLOR: u32 = 0xFF0000;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("template has neither message content nor embeds")]
    Empty,
}

/// A single rich block that could not be built. Only that block is dropped.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("embed is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid colour {0}")]
    Color(String),
}

/// A stored message template.
///
/// Embeds are kept as raw JSON so a malformed block only fails on its own
/// when it is rendered.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub message_content: Option<String>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
}

impl Template {
    /// Parse template JSON. A template with no content and no embeds is
    /// rejected so the caller falls back to the default message.
    pub fn parse(json: &str) -> Result<Self, TemplateError> {
        let template: Template = serde_json::from_str(json)?;
        let has_content = template
            .message_content
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if !has_content && template.embeds.is_empty() {
            return Err(TemplateError::Empty);
        }
        Ok(template)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbedTemplate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub color: Option<serde_json::Value>,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub footer_text: Option<String>,
    pub footer_icon_url: Option<String>,
}

impl EmbedTemplate {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, BlockError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// `"#RRGGBB"`, `"RRGGBB"`, `"0xRRGGBB"` or an integer. Missing or null
    /// means [`DEFAULT_COLOR`].
    pub fn color(&self) -> Result<u32, BlockError> {
        let Some(value) = &self.color else {
            return Ok(DEFAULT_COLOR);
        };
        let invalid = || BlockError::Color(value.to_string());

        match value {
            serde_json::Value::Null => Ok(DEFAULT_COLOR),
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n <= 0xFFFFFF)
                .ok_or_else(invalid),
            serde_json::Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(DEFAULT_COLOR);
                }
                let hex = s
                    .strip_prefix('#')
                    .or_else(|| s.strip_prefix("0x"))
                    .unwrap_or(s);
                if hex.is_empty() || hex.len() > 6 {
                    return Err(invalid());
                }
                u32::from_str_radix(hex, 16).map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }
}

/// Values available to `{…}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct Variables<'a> {
    pub title: &'a str,
    pub url: &'a str,
    pub thumbnail: &'a str,
    pub channel_name: &'a str,
    pub game: &'a str,
}

impl<'a> Variables<'a> {
    pub fn from_event(event: &'a ContentEvent) -> Self {
        Self {
            title: &event.title,
            url: &event.canonical_url,
            thumbnail: &event.thumbnail_url,
            channel_name: &event.channel_name,
            game: event.game(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&'a str> {
        match name {
            "content.title" => Some(self.title),
            "content.url" => Some(self.url),
            "content.thumbnail" => Some(self.thumbnail),
            "channel.name" => Some(self.channel_name),
            "content.game" => Some(self.game),
            _ => None,
        }
    }
}

fn is_variable_name(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Replace `{name}` placeholders.
///
/// Known names get their value, unknown variable-shaped names become empty.
/// Braces around anything else (JSON snippets, emoticons) are left as written.
/// Substituted values are never rescanned.
pub fn substitute(text: &str, vars: &Variables<'_>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find('}') {
            Some(close) if is_variable_name(&after[..close]) => {
                out.push_str(vars.lookup(&after[..close]).unwrap_or(""));
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VARS: Variables<'static> = Variables {
        title: "Ep 5",
        url: "https://www.youtube.com/watch?v=abc123",
        thumbnail: "https://img.youtube.com/vi/abc123/maxresdefault.jpg",
        channel_name: "Chan",
        game: "",
    };

    #[test]
    fn test_known_variables() {
        assert_eq!(
            substitute("{channel.name} posted [{content.title}]({content.url})", &VARS),
            "Chan posted [Ep 5](https://www.youtube.com/watch?v=abc123)"
        );
    }

    #[test]
    fn test_unknown_variables_render_empty() {
        assert_eq!(substitute("a{content.views}b{foo}c", &VARS), "abc");
        assert_eq!(substitute("playing {content.game}!", &VARS), "playing !");
    }

    #[test]
    fn test_non_variable_braces_kept() {
        assert_eq!(substitute("{ not a var } :-{", &VARS), "{ not a var } :-{");
        assert_eq!(substitute("{{content.title}}", &VARS), "{Ep 5}");
        assert_eq!(substitute("{}", &VARS), "{}");
    }

    #[test]
    fn test_template_parse() {
        assert!(matches!(Template::parse("{}"), Err(TemplateError::Empty)));
        assert!(matches!(
            Template::parse(r#"{"message_content": "  "}"#),
            Err(TemplateError::Empty)
        ));
        assert!(matches!(Template::parse("not json"), Err(TemplateError::Json(_))));

        let t = Template::parse(r#"{"message_content": "hi", "embeds": [{"title": "x"}, 5]}"#)
            .unwrap();
        assert_eq!(t.embeds.len(), 2);
        assert!(EmbedTemplate::from_value(&t.embeds[0]).is_ok());
        assert!(EmbedTemplate::from_value(&t.embeds[1]).is_err());
    }

    #[test]
    fn test_colors() {
        let with = |v: serde_json::Value| EmbedTemplate {
            color: Some(v),
            ..Default::default()
        };
        assert_eq!(EmbedTemplate::default().color().unwrap(), DEFAULT_COLOR);
        assert_eq!(with("#00FF00".into()).color().unwrap(), 0x00FF00);
        assert_eq!(with("0x0000ff".into()).color().unwrap(), 0x0000FF);
        assert_eq!(with(16711680.into()).color().unwrap(), 0xFF0000);
        assert!(with("#GGGGGG".into()).color().is_err());
        assert!(with("#1234567".into()).color().is_err());
        assert!(with(serde_json::json!(-1)).color().is_err());
        assert!(with(serde_json::json!([1])).color().is_err());
    }

    proptest! {
        #[test]
        fn text_without_braces_is_unchanged(s in "[^{}]*") {
            prop_assert_eq!(substitute(&s, &VARS), s);
        }

        #[test]
        fn known_placeholders_never_survive(prefix in "[a-z ]{0,10}", suffix in "[a-z ]{0,10}") {
            let text = format!("{prefix}{{content.title}}{suffix}{{channel.name}}");
            let out = substitute(&text, &VARS);
            prop_assert!(!out.contains("{content.title}"), "title placeholder left in {:?}", out);
            prop_assert!(!out.contains("{channel.name}"), "channel placeholder left in {:?}", out);
            prop_assert_eq!(out, format!("{prefix}Ep 5{suffix}Chan"));
        }

        #[test]
        fn undefined_variables_are_empty(name in "[a-z]{1,8}\\.[a-z]{1,8}") {
            prop_assume!(VARS.lookup(&name).is_none());
            prop_assert_eq!(substitute(&format!("<{{{name}}}>"), &VARS), "<>");
        }
    }
}
