use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Why a URL was rejected for use in an outgoing message.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// Loopback, private, link-local or unspecified address
    #[error("Non-public address not allowed: {0}")]
    NonPublic(String),
}

/// Validates a template-supplied link or image URL before it is embedded in
/// an outgoing message.
///
/// Operator templates are free text, so an embed could otherwise point the
/// chat client at `file://` or an intranet host. Only `http`/`https` URLs with a
/// public host pass.
///
/// ```
/// use feedcast::util::validate_url;
///
/// let url = validate_url("https://i.ytimg.com/vi/abc123/hqdefault.jpg").unwrap();
/// assert_eq!(url.host_str(), Some("i.ytimg.com"));
///
/// assert!(validate_url("http://localhost/img.png").is_err());
/// assert!(validate_url("http://192.168.1.1/img.png").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::NonPublic(host.to_owned()));
        }

        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = bare.parse::<IpAddr>() {
            if !is_public_ip(&ip) {
                return Err(UrlValidationError::NonPublic(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link-local
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}
