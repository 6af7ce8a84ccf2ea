//! Transport-neutral error kinds and their HTTP mapping.
//!
//! Handlers return `ApiError`; the `IntoResponse` impl turns each kind into a
//! machine-readable `{code, message}` body. Unexpected errors are logged with
//! a correlation id and surface only the id to the client.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("sequencer contention")]
    SequencerContention,
    #[error("{0}")]
    Unavailable(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::Auth(_) => "AUTH",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::SequencerContention => "SEQUENCER_CONTENTION",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::SequencerContention => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient kinds are retried internally before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SequencerContention | Self::Unavailable(_))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "correlationId")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "retryAfter")]
    retry_after: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let body = match &self {
            ApiError::Internal(err) => {
                let correlation_id = ulid::Ulid::new().to_string();
                // The raw error goes to the log only; the client sees the id.
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %crate::redact::error_chain(err),
                    "unhandled internal error"
                );
                ErrorBody {
                    code,
                    message: "internal error".to_string(),
                    correlation_id: Some(correlation_id),
                    retry_after: None,
                }
            }
            ApiError::RateLimited { retry_after_secs } => ErrorBody {
                code,
                message: self.to_string(),
                correlation_id: None,
                retry_after: Some(*retry_after_secs),
            },
            _ => ErrorBody {
                code,
                message: self.to_string(),
                correlation_id: None,
                retry_after: None,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_str(&retry_after_secs.to_string())
                    .unwrap_or(HeaderValue::from_static("1")),
            );
        }
        response
    }
}

/// Maximum backoff between internal retries.
const BACKOFF_CAP: Duration = Duration::from_millis(200);

/// Retry a transient operation with exponential backoff capped at 200 ms.
///
/// Non-transient errors and exhausted attempts surface unchanged.
pub async fn retry_transient<T, F, Fut>(
    op: &'static str,
    attempts: u32,
    mut call: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut delay = Duration::from_millis(25);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::debug!(op, attempt, error = %err, "retrying transient failure");
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay = (delay * 2).min(BACKOFF_CAP);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::SequencerContention.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::RateLimited { retry_after_secs: 5 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::PayloadTooLarge { size: 2, limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_transient("test", 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiError::SequencerContention)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Forbidden("no".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::SequencerContention) }
        })
        .await;
        assert!(matches!(result, Err(ApiError::SequencerContention)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
