use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Closed enumeration of error kinds the core can produce.
///
/// Every operation that converts an unknown error into the canonical form
/// attaches a kind from this list. Each response carries at most one kind;
/// chained causes live in `AppError::details`, not in a second kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidResponse,
    AuthFailure,
    OriginNotFound,
    OriginFetchFailed,
    TransformFailed,
    CacheUnavailable,
    CacheReadFailed,
    CacheWriteFailed,
    CacheQuotaExceeded,
    TagGenerationFailed,
    Timeout,
    CircuitOpen,
    Internal,
}

impl ErrorKind {
    /// Default HTTP status for this kind, overridable per call site.
    pub fn default_status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::InvalidResponse => StatusCode::BAD_GATEWAY,
            ErrorKind::AuthFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::OriginNotFound => StatusCode::NOT_FOUND,
            ErrorKind::OriginFetchFailed => StatusCode::BAD_GATEWAY,
            ErrorKind::TransformFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::CacheUnavailable => StatusCode::OK, // read errors degrade to miss, never surfaced
            ErrorKind::CacheReadFailed => StatusCode::OK,
            ErrorKind::CacheWriteFailed => StatusCode::OK,
            ErrorKind::CacheQuotaExceeded => StatusCode::OK,
            ErrorKind::TagGenerationFailed => StatusCode::OK,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether an operation that failed with this kind is safe to retry.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::OriginFetchFailed
                | ErrorKind::Timeout
                | ErrorKind::CacheReadFailed
                | ErrorKind::CacheWriteFailed
        )
    }
}

/// The sole canonical error type the core hands back to callers.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {context}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub http_status: StatusCode,
    pub retryable: bool,
    pub context: String,
    pub source_url: Option<String>,
}

impl AppError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        let context = context.into();
        // "Quota exceeded" phrases in underlying messages are promoted to
        // the quota-exceeded kind, even when the call site tagged
        // something more generic.
        let kind = if kind != ErrorKind::CacheQuotaExceeded
            && context.to_lowercase().contains("quota exceeded")
        {
            ErrorKind::CacheQuotaExceeded
        } else {
            kind
        };
        Self {
            retryable: kind.retryable(),
            http_status: kind.default_status(),
            kind,
            context,
            source_url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.http_status = status;
        self
    }

    pub fn internal(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, context)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: ErrorKind,
    error: &'a str,
    #[serde(rename = "originatingUrl", skip_serializing_if = "Option::is_none")]
    source_url: &'a Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            kind: self.kind,
            error: &self.context,
            source_url: &self.source_url,
        };
        let status = self.http_status;
        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::OriginFetchFailed
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<sled::Error> for AppError {
    fn from(e: sled::Error) -> Self {
        AppError::new(ErrorKind::CacheWriteFailed, e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::new(ErrorKind::Internal, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_phrase_is_promoted() {
        let e = AppError::new(ErrorKind::CacheWriteFailed, "sled: Quota exceeded for db");
        assert_eq!(e.kind, ErrorKind::CacheQuotaExceeded);
    }

    #[test]
    fn retryable_kinds_match_spec() {
        assert!(ErrorKind::OriginFetchFailed.retryable());
        assert!(ErrorKind::Timeout.retryable());
        assert!(!ErrorKind::AuthFailure.retryable());
        assert!(!ErrorKind::InvalidRequest.retryable());
    }
}
