//! Rendering and delivery of notifications.
//!
//! - [`render`] turns a [`crate::event::ContentEvent`] plus a feed's template into a [`Message`]
//! - [`template`] holds the operator template format and `{variable}` substitution
//! - [`discord`] delivers messages to Discord text channels
//!
//! Delivery goes through the [`Dispatcher`] trait so the pipeline can be
//! exercised against a recording implementation.

pub mod discord;
pub mod render;
pub mod template;

pub use discord::DiscordDispatcher;
pub use render::{Embed, Message, RenderOptions, Renderer};
pub use template::{Template, TemplateError};

use thiserror::Error;

/// Why a delivery attempt failed. Every variant is terminal for the attempt;
/// nothing is retried automatically.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Target channel does not exist (or the bot cannot see it)
    #[error("delivery target {0} not found")]
    NotFound(String),
    #[error("not allowed to post in {0}")]
    Forbidden(String),
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<f64> },
    #[error("delivery failed: {0}")]
    Other(String),
}

impl DeliveryError {
    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::NotFound(_) => "not_found",
            DeliveryError::Forbidden(_) => "forbidden",
            DeliveryError::RateLimited { .. } => "rate_limited",
            DeliveryError::Other(_) => "other",
        }
    }
}

/// Delivers a rendered message to an opaque target id.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    async fn deliver(&self, target: &str, message: &Message) -> Result<(), DeliveryError>;
}
