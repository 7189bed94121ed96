//! Small helpers shared by the adapters and the renderer.
//!
//! - **Text**: character-safe truncation to chat limits, control-character stripping
//! - **URL validation**: keeps template-supplied links on public http(s) hosts

mod text;
mod url_validator;

pub use text::{strip_control_chars, truncate_chars};
pub use url_validator::{validate_url, UrlValidationError};
