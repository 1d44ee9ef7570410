//! Shared HTTP plumbing for the adapters.

use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::ProviderError;

/// Returns `true` if the HTTP status code is transient and should be retried.
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504 | 529)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorResponse {
    Single(ErrorBody),
    Multiple(Vec<ErrorBody>),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorResponse {
    fn message(&self) -> String {
        match self {
            Self::Single(b) => b.error.message.clone(),
            Self::Multiple(v) => v
                .first()
                .map(|b| b.error.message.clone())
                .unwrap_or_else(|| "Unknown error".into()),
        }
    }
}

pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.message())
        .unwrap_or_else(|_| body.to_string())
}

/// Send a request and parse a JSON body, classifying failures.
///
/// Network errors and retryable statuses become
/// [`ProviderError::Transient`]; other non-2xx statuses become
/// [`ProviderError::Rejected`].
pub(crate) async fn send_json(request: RequestBuilder) -> Result<Value, ProviderError> {
    let response = request.send().await.map_err(|e| {
        warn!(error = %e, "Network error calling provider API");
        ProviderError::Transient(e.to_string())
    })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::Transient(format!("failed to read response body: {e}")))?;

    if !status.is_success() {
        let message = error_message(&body);
        if is_retryable_status(status) {
            warn!(status = %status, "Transient provider API error");
            return Err(ProviderError::Transient(format!("{status}: {message}")));
        }
        return Err(ProviderError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    debug!(status = %status, bytes = body.len(), "Provider API response");
    serde_json::from_str(&body)
        .map_err(|e| ProviderError::Malformed(format!("response is not JSON: {e}")))
}

/// Trim a trailing slash from a configured base URL, falling back to `default`.
pub(crate) fn base_url(api_base: Option<&str>, default: &str) -> String {
    api_base
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}
