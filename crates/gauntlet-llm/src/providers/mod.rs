pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use std::time::Duration;

use reqwest::{Client, StatusCode};

use gauntlet_core::error::{GauntletError, Result};
use gauntlet_core::types::ProviderError;

/// HTTP client with the provider's request timeout applied.
pub(crate) fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| GauntletError::Config(format!("failed to build HTTP client: {e}")))
}

/// Rate limiting, timeouts and server-side errors are worth retrying.
pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Classify a non-success HTTP response.
pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{provider}: HTTP {status}: {}", truncate(body, 300));
    if is_transient_status(status) {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

/// Classify a transport failure. Timeouts and connection errors are transient;
/// a request that could not even be built is not.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> ProviderError {
    let message = format!("{provider}: {e}");
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_core::types::ProviderErrorKind;

    #[test]
    fn test_status_classification() {
        for code in [408, 429, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(is_transient_status(status), "{code}");
            assert_eq!(status_error("p", status, "").kind, ProviderErrorKind::Transient);
        }
        for code in [400, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(status_error("p", status, "").kind, ProviderErrorKind::Permanent);
        }
    }

    #[test]
    fn test_error_message_is_bounded() {
        let body = "x".repeat(5000);
        let err = status_error("gemini", StatusCode::BAD_REQUEST, &body);
        assert!(err.message.starts_with("gemini: HTTP 400"));
        assert!(err.message.len() < 400);
    }
}
