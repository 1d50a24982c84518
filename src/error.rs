use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Reason codes returned to ingestion callers. Admission reasons come from
/// the quota enforcer, validation reasons from the partition manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    RateExceeded,
    StorageExceeded,
    SourceCountExceeded,
    TenantSuspended,
    TimestampOutOfBounds,
    SchemaMismatch,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::RateExceeded => "rate_exceeded",
            RejectReason::StorageExceeded => "storage_exceeded",
            RejectReason::SourceCountExceeded => "source_count_exceeded",
            RejectReason::TenantSuspended => "tenant_suspended",
            RejectReason::TimestampOutOfBounds => "timestamp_out_of_bounds",
            RejectReason::SchemaMismatch => "schema_mismatch",
        }
    }

    /// Validation reasons are caller errors and are never retried; admission
    /// reasons may clear once the usage window rolls over.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RejectReason::RateExceeded | RejectReason::StorageExceeded
        )
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("admission rejected: {0}")]
    Admission(RejectReason),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for TelemetryError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            TelemetryError::Admission(reason) => match reason {
                RejectReason::TenantSuspended => (StatusCode::FORBIDDEN, "ADMISSION"),
                _ => (StatusCode::TOO_MANY_REQUESTS, "ADMISSION"),
            },
            TelemetryError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION"),
            TelemetryError::TransientStore(_) => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT_STORE"),
            TelemetryError::ConsistencyViolation(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CONSISTENCY_VIOLATION")
            }
            TelemetryError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            TelemetryError::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
            TelemetryError::Config(_) => (StatusCode::BAD_REQUEST, "CONFIG"),
            TelemetryError::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, "TIMEOUT"),
            TelemetryError::Serialization(_) => (StatusCode::BAD_REQUEST, "SERIALIZATION"),
            TelemetryError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO"),
            TelemetryError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

impl TelemetryError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        TelemetryError::Validation(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        TelemetryError::TransientStore(msg.into())
    }

    pub fn consistency<S: Into<String>>(msg: S) -> Self {
        TelemetryError::ConsistencyViolation(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        TelemetryError::NotFound(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        TelemetryError::InvalidState(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        TelemetryError::Config(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        TelemetryError::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        TelemetryError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_codes_are_snake_case() {
        assert_eq!(RejectReason::RateExceeded.as_str(), "rate_exceeded");
        assert_eq!(
            serde_json::to_string(&RejectReason::TimestampOutOfBounds).unwrap(),
            "\"timestamp_out_of_bounds\""
        );
    }

    #[test]
    fn retryability_split() {
        assert!(RejectReason::RateExceeded.is_retryable());
        assert!(!RejectReason::SchemaMismatch.is_retryable());
        assert!(!RejectReason::TenantSuspended.is_retryable());
    }
}
