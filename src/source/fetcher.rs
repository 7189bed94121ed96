use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

/// Largest document any adapter will read.
pub const MAX_DOCUMENT_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// Errors from a single outbound fetch.
///
/// Adapters decide what to do from [`FetchError::is_quota_or_auth`]: quota or
/// credential failures abandon the rest of the cycle, everything else only
/// skips the one source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Non-2xx response that is neither quota nor auth related
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// 403 or 429 from an upstream that meters requests
    #[error("Quota exhausted or credentials rejected (status {0})")]
    QuotaOrAuth(u16),
    /// Document could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl FetchError {
    pub fn is_quota_or_auth(&self) -> bool {
        matches!(self, FetchError::QuotaOrAuth(_))
    }

    /// Failures worth retrying next cycle without operator attention.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout | FetchError::IncompleteResponse { .. } => {
                true
            }
            FetchError::HttpStatus(status) => *status >= 500,
            _ => false,
        }
    }
}

/// Map a response status onto the adapter error model. `None` means success.
pub fn classify_status(status: reqwest::StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    Some(match code {
        403 | 429 => FetchError::QuotaOrAuth(code),
        _ => FetchError::HttpStatus(code),
    })
}

/// Send `request` and read the body, all within `timeout`.
///
/// No retries: a failed source is simply polled again on the next tick.
pub async fn fetch_bytes(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<Vec<u8>, FetchError> {
    tokio::time::timeout(timeout, async {
        let response = request.send().await?;
        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }
        read_limited_bytes(response, MAX_DOCUMENT_SIZE).await
    })
    .await
    .map_err(|_| FetchError::Timeout)?
}

/// Read a response body, refusing anything larger than `limit` bytes.
pub async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let bytes = fetch_bytes(client.get(format!("{}/doc", server.uri())), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_quota_statuses() {
        for status in [403u16, 429] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let err = fetch_bytes(reqwest::Client::new().get(server.uri()), TIMEOUT)
                .await
                .unwrap_err();
            assert!(err.is_quota_or_auth(), "{status} should be quota/auth");
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1) // no retries
            .mount(&server)
            .await;

        let err = fetch_bytes(reqwest::Client::new().get(server.uri()), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(503)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_not_found_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetch_bytes(reqwest::Client::new().get(server.uri()), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = fetch_bytes(
            reqwest::Client::new().get(server.uri()),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; MAX_DOCUMENT_SIZE + 1]))
            .mount(&server)
            .await;

        let err = fetch_bytes(reqwest::Client::new().get(server.uri()), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }
}
