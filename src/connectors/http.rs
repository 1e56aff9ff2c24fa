//! Response handling shared by the HTTP adapters.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use std::time::Duration;

use super::ConnectorError;

pub(crate) const USER_AGENT: &str = concat!("threadwatch/", env!("CARGO_PKG_VERSION"));

/// Client with the adapter's request budget applied.
pub(crate) fn build_client(timeout: Duration) -> Result<Client, ConnectorError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|err| ConnectorError::ConfigurationError {
            details: format!("failed to build HTTP client: {}", err),
        })
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Pass a successful response through, map anything else to a [`ConnectorError`].
pub(crate) async fn ensure_success(response: Response) -> Result<Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = retry_after(response.headers());
    // An exhausted quota is reported as 403 with a zero remaining count
    let quota_exhausted = status.as_u16() == 403
        && response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|value| value.to_str().ok())
            == Some("0");
    let body = response.text().await.ok().filter(|body| !body.is_empty());

    if quota_exhausted {
        return Err(ConnectorError::RateLimitError { retry_after });
    }
    Err(ConnectorError::from_status(status.as_u16(), body, retry_after))
}

/// Decode a JSON body, keeping the raw text on failure.
pub(crate) async fn json_body<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T, ConnectorError> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|err| ConnectorError::MalformedResponse {
        details: err.to_string(),
        partial_data: Some(text.chars().take(512).collect()),
    })
}
