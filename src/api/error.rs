//! Error taxonomy shared by every handler.
//!
//! Expected conditions (bad credentials, missing session, malformed
//! idempotency key, role violations) map to explicit variants with stable
//! status codes. Unexpected persistence failures collapse into `Internal`,
//! which logs the chain and answers with a generic 500 so database details
//! never reach clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// No, invalid or expired credentials.
    #[error("{0}")]
    Authentication(String),

    /// Valid identity, insufficient role.
    #[error("{0}")]
    Authorization(String),

    /// Refresh session presented from a different device signature.
    /// Always paired with deletion of the implicated session.
    #[error("Session compromised. Logged out from this device.")]
    SessionCompromised,

    /// Malformed input, e.g. a bad idempotency key or empty cart.
    #[error("{0}")]
    Validation(String),

    /// Idempotency key reused while a prior attempt is still running.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// Anything the taxonomy does not expect; becomes a generic 500.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) | Self::SessionCompromised => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if let Self::Internal(err) = &self {
            error!("Internal error: {err:#}");
            "Something went wrong".to_string()
        } else {
            self.to_string()
        };

        // 4xx are client faults ("fail"), 5xx are server faults ("error").
        let envelope = if status.is_client_error() {
            "fail"
        } else {
            "error"
        };

        let body = Json(json!({
            "status": envelope,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ApiError::Authentication("no".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Authorization("no".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::SessionCompromised.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Conflict("busy".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::NotFound("gone".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Internal(anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_never_leak_details() {
        let response = ApiError::Internal(anyhow!("connection refused")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn session_compromised_has_fixed_message() {
        assert_eq!(
            ApiError::SessionCompromised.to_string(),
            "Session compromised. Logged out from this device."
        );
    }
}
