use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error};

/// API-level failure taxonomy. Every handler returns `Result<_, ApiError>`;
/// the `IntoResponse` impl is the single place errors become status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input; rejected before touching storage.
    #[error("{0}")]
    Validation(String),

    /// Email or username already taken.
    #[error("{0}")]
    Conflict(String),

    /// Any credential or token failure. The message is uniform no matter
    /// the cause so responses cannot be used to enumerate accounts; the
    /// actual cause is kept in `detail` and only ever logged.
    #[error("authentication failed")]
    Auth { detail: &'static str },

    #[error("{0}")]
    NotFound(String),

    /// A one-time code past its expiry. The pending record is gone by the
    /// time this is returned.
    #[error("{0}")]
    Expired(String),

    #[error("verification code is incorrect")]
    InvalidCode,

    /// The verification email could not be dispatched; the pending
    /// registration is retained for a retry.
    #[error("verification email could not be sent")]
    Delivery(#[source] anyhow::Error),

    #[error("storage failure")]
    Storage(#[from] anyhow::Error),
}

impl ApiError {
    pub fn auth(detail: &'static str) -> Self {
        Self::Auth { detail }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) | ApiError::Expired(_) | ApiError::InvalidCode => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Auth { detail } => {
                debug!("auth rejected: {}", detail);
                StatusCode::UNAUTHORIZED
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Delivery(e) => {
                error!("verification email dispatch failed: {:#}", e);
                StatusCode::BAD_GATEWAY
            }
            ApiError::Storage(e) => {
                error!("storage failure: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}
