//! Application error type with consistent JSON responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{
    auth::{identity::VerificationError, jwt::TokenError},
    chat::services::ChatError,
    users::repo::RepoError,
};

/// A single rejected input field.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("email already registered")]
    DuplicateEmail,

    #[error("external identity already linked to another account")]
    IdentityConflict,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    #[error("token subject no longer exists")]
    UserGone,

    #[error("external verification failed: {0}")]
    ExternalVerification(#[from] VerificationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("chat relay: {0}")]
    Chat(#[from] ChatError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<RepoError> for AppError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::DuplicateEmail => AppError::DuplicateEmail,
            RepoError::DuplicateSubject => AppError::IdentityConflict,
            RepoError::Unavailable(e) => AppError::StoreUnavailable(e.to_string()),
            RepoError::Other(e) => AppError::Internal(anyhow::Error::new(e)),
        }
    }
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<FieldError>>,
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed".into()),
            AppError::DuplicateEmail => (
                StatusCode::CONFLICT,
                "User already exists with this email".into(),
            ),
            AppError::IdentityConflict => (
                StatusCode::CONFLICT,
                "External identity is linked to another account".into(),
            ),
            AppError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid email or password".into())
            }
            AppError::Token(TokenError::Missing) => (
                StatusCode::UNAUTHORIZED,
                "No token provided, authorization denied".into(),
            ),
            AppError::Token(TokenError::Expired) => {
                (StatusCode::UNAUTHORIZED, "Token has expired".into())
            }
            AppError::Token(_) => (StatusCode::UNAUTHORIZED, "Invalid token".into()),
            AppError::UserGone => (
                StatusCode::UNAUTHORIZED,
                "Token is valid but user no longer exists".into(),
            ),
            AppError::ExternalVerification(VerificationError::Unavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Identity provider temporarily unavailable".into(),
            ),
            AppError::ExternalVerification(_) => {
                (StatusCode::UNAUTHORIZED, "Invalid identity token".into())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable".into(),
            ),
            AppError::Chat(e) => (e.status(), e.client_message().into()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".into(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::StoreUnavailable(detail) => {
                tracing::error!(error = %detail, "credential store unavailable");
            }
            AppError::Internal(err) => {
                tracing::error!(error = ?err, "internal server error");
            }
            AppError::ExternalVerification(e) => {
                tracing::warn!(error = %e, "external assertion rejected");
            }
            AppError::Chat(e) => {
                tracing::warn!(error = %e, "chat relay failed");
            }
            _ => {}
        }

        let (status, message) = self.status_and_message();
        let errors = match self {
            AppError::Validation(errors) => Some(errors),
            _ => None,
        };

        (status, Json(ErrorResponse { message, errors })).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
