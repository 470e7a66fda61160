use crate::{auth::provider::ProviderError, storage::StorageError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Shown to users whenever a callback cannot be tied to a login attempt we issued.
pub const CSRF_FAILURE_MESSAGE: &str =
    "Login failed: unable to verify the login attempt. Please log in again.";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("CSRF validation failed: {0}")]
    CsrfMismatch(String),
    #[error("Session unavailable: {0}")]
    SessionContext(String),
    #[error("Unknown provider: {0}")]
    ProviderNotFound(String),
    #[error("Login failed: {0}")]
    Provider(String),
    #[error("Authorization code missing from callback")]
    MissingCode,
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(id) => AppError::ProviderNotFound(id),
            ProviderError::MissingCode => AppError::MissingCode,
            ProviderError::CsrfMismatch => AppError::CsrfMismatch(
                "state or nonce returned by the provider does not match".to_string(),
            ),
            ProviderError::Upstream(msg) => AppError::Provider(format!(
                "The upstream identity provider returned an error: {msg}"
            )),
            other => AppError::Provider(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error"),
            AppError::CsrfMismatch(_) => (StatusCode::FORBIDDEN, "CSRF validation failed"),
            AppError::SessionContext(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Session unavailable")
            }
            AppError::ProviderNotFound(_) => (StatusCode::BAD_REQUEST, "Unknown provider"),
            AppError::Provider(_) => (StatusCode::FORBIDDEN, "Login failed"),
            AppError::MissingCode => (StatusCode::BAD_REQUEST, "Missing authorization code"),
            AppError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Persistence error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        // CSRF failures never echo the mismatch detail
        let message = match &self {
            AppError::CsrfMismatch(_) => CSRF_FAILURE_MESSAGE.to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": error_message,
            "message": message
        }));

        (status, body).into_response()
    }
}
