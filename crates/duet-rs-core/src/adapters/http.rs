//! HTTP plumbing shared by the hosted-model adapters.

use super::AdapterBuildError;
use duet_rs_protocol::AdapterFailure;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest provider error message carried into a failure.
const MAX_ERROR_MESSAGE_LEN: usize = 300;

pub(crate) fn build_client() -> Result<Client, AdapterBuildError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|err| AdapterBuildError::HttpClient(err.to_string()))
}

/// Strip a trailing slash so paths can be appended with `format!`.
pub(crate) fn normalize_base_url(base_url: &str) -> Result<String, AdapterBuildError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(AdapterBuildError::InvalidBaseUrl(base_url.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Send `body` as JSON and decode a JSON reply, giving up with `Cancelled`
/// as soon as `cancel` fires.
pub(crate) async fn post_json<B, R>(
    request: RequestBuilder,
    body: &B,
    cancel: &CancellationToken,
) -> Result<R, AdapterFailure>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AdapterFailure::Cancelled),
        result = send_and_decode(request, body) => result,
    }
}

async fn send_and_decode<B, R>(request: RequestBuilder, body: &B) -> Result<R, AdapterFailure>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = request
        .json(body)
        .send()
        .await
        .map_err(map_transport_error)?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let body = response.text().await.unwrap_or_default();
        return Err(map_http_error(status, &body, retry_after));
    }

    let bytes = response.bytes().await.map_err(map_transport_error)?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AdapterFailure::InvalidResponse(format!("failed to decode response: {err}")))
}

pub(crate) fn map_transport_error(err: reqwest::Error) -> AdapterFailure {
    if err.is_timeout() {
        AdapterFailure::Timeout
    } else if err.is_decode() {
        AdapterFailure::InvalidResponse(err.to_string())
    } else {
        AdapterFailure::NetworkError(err.to_string())
    }
}

pub(crate) fn map_http_error(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> AdapterFailure {
    let message = provider_message(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterFailure::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => AdapterFailure::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AdapterFailure::Timeout,
        other => AdapterFailure::NetworkError(format!("status {}: {message}", other.as_u16())),
    }
}

/// Pull a human-readable message out of a provider error body.
///
/// Understands `{"error": {"status", "message"}}` and `{"error": "..."}`;
/// anything else is passed through as text.
fn provider_message(body: &str) -> String {
    let message = match serde_json::from_str::<Value>(body) {
        Ok(value) => match value.get("error") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Object(error)) => {
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(body)
                    .to_string();
                match error.get("status").and_then(Value::as_str) {
                    Some(status) if !status.is_empty() => format!("{status}: {text}"),
                    _ => text,
                }
            }
            _ => body.to_string(),
        },
        Err(_) => body.to_string(),
    };
    let message = message.trim();
    if message.is_empty() {
        return "empty error body".to_string();
    }
    message.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}

/// Only the delta-seconds form of `Retry-After` is understood.
pub(crate) fn parse_retry_after(header: Option<&HeaderValue>) -> Option<Duration> {
    let value = header?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_codes_map_to_failures() {
        assert_eq!(
            map_http_error(StatusCode::FORBIDDEN, r#"{"error":"bad key"}"#, None),
            AdapterFailure::Unauthorized("bad key".to_string())
        );
        assert_eq!(
            map_http_error(
                StatusCode::TOO_MANY_REQUESTS,
                "",
                Some(Duration::from_secs(3))
            ),
            AdapterFailure::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(
            map_http_error(StatusCode::GATEWAY_TIMEOUT, "", None),
            AdapterFailure::Timeout
        );
        assert_eq!(
            map_http_error(
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":{"code":503,"message":"overloaded","status":"UNAVAILABLE"}}"#,
                None
            ),
            AdapterFailure::NetworkError("status 503: UNAVAILABLE: overloaded".to_string())
        );
        assert_eq!(
            map_http_error(StatusCode::BAD_GATEWAY, "   ", None),
            AdapterFailure::NetworkError("status 502: empty error body".to_string())
        );
    }

    #[test]
    fn retry_after_accepts_seconds_only() {
        let seconds = HeaderValue::from_static("12");
        assert_eq!(
            parse_retry_after(Some(&seconds)),
            Some(Duration::from_secs(12))
        );
        let date = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&date)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn base_url_requires_http_scheme() {
        assert_eq!(
            normalize_base_url("https://example.com/v1/").expect("url"),
            "https://example.com/v1"
        );
        assert!(normalize_base_url("example.com").is_err());
    }
}
