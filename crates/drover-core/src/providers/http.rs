//! Shared HTTP/SSE plumbing for provider adapters.
//!
//! Adapters own their wire formats; what they share is credential/base-URL
//! resolution, transport-error classification into [`ProviderErrorKind`], and
//! the streaming POST that hands back a parsed server-sent-event stream.

use anyhow::{Context, Result};
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;

use super::{ProviderError, ProviderResult};

/// Standard User-Agent header for API requests.
pub const USER_AGENT: &str = concat!("drover/", env!("CARGO_PKG_VERSION"));

/// Resolves an API key with precedence: config > env.
///
/// # Errors
/// Returns an error if neither source provides a non-empty key.
pub fn resolve_api_key(
    config_api_key: Option<&str>,
    env_var: &str,
    config_section: &str,
) -> Result<String> {
    if let Some(key) = config_api_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    std::env::var(env_var).context(format!(
        "No API key available. Set {env_var} or api_key in [providers.{config_section}]."
    ))
}

/// Resolves a base URL with precedence: env > config > default.
///
/// # Errors
/// Returns an error if a configured URL is malformed.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
    provider_name: &str,
) -> Result<String> {
    if let Ok(env_url) = std::env::var(env_var) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.to_string());
        }
    }

    if let Some(config_url) = config_base_url {
        let trimmed = config_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.to_string());
        }
    }

    Ok(default_url.to_string())
}

fn validate_url(url: &str, provider_name: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid {provider_name} base URL: {url}"))?;
    Ok(())
}

/// Classifies a transport error into the provider taxonomy.
pub fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::connection(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::connection(format!("Request error: {e}"))
    } else {
        ProviderError::other(format!("Network error: {e}"))
    }
}

/// Parsed server-sent-event stream with classified errors.
pub type SseStream = BoxStream<'static, ProviderResult<Event>>;

/// Sends a streaming POST and returns the response's SSE event stream.
///
/// Non-2xx responses become `Status(code)` errors carrying the body;
/// transport failures before and during the stream are classified via
/// [`classify_reqwest_error`].
///
/// # Errors
/// Returns an error if the request cannot be sent or the response status is
/// not successful.
pub async fn send_sse_request(
    client: &reqwest::Client,
    url: &str,
    request: &impl Serialize,
    header_fn: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
) -> ProviderResult<SseStream> {
    let builder = client
        .post(url)
        .header("content-type", "application/json")
        .header("accept", "text/event-stream")
        .header("user-agent", USER_AGENT)
        .json(request);

    let response = header_fn(builder)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        return Err(ProviderError::http_status(status.as_u16(), &error_body));
    }

    let events = response
        .bytes_stream()
        .eventsource()
        .map(|item| item.map_err(classify_sse_error));
    Ok(Box::pin(events))
}

fn classify_sse_error(error: EventStreamError<reqwest::Error>) -> ProviderError {
    match error {
        EventStreamError::Transport(e) => classify_reqwest_error(&e),
        other => ProviderError::other(format!("Invalid SSE frame: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_api_key_prefers_config() {
        let key = resolve_api_key(Some("  from-config  "), "DROVER_TEST_NO_SUCH_VAR", "mock");
        assert_eq!(key.unwrap(), "from-config");
    }

    #[test]
    fn test_resolve_api_key_errors_without_sources() {
        let err = resolve_api_key(Some("   "), "DROVER_TEST_NO_SUCH_VAR", "mock").unwrap_err();
        assert!(err.to_string().contains("DROVER_TEST_NO_SUCH_VAR"));
    }

    #[test]
    fn test_resolve_base_url_falls_back_to_default() {
        let url = resolve_base_url(
            None,
            "DROVER_TEST_NO_SUCH_URL",
            "https://api.example.com",
            "mock",
        )
        .unwrap();
        assert_eq!(url, "https://api.example.com");
    }

    #[test]
    fn test_resolve_base_url_rejects_malformed_config() {
        let err = resolve_base_url(
            Some("not a url"),
            "DROVER_TEST_NO_SUCH_URL",
            "https://api.example.com",
            "mock",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid mock base URL"));
    }
}
