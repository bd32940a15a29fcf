use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Authentication error: {0}")]
    AuthError(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Email error: {0}")]
    EmailError(String),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// HTTP status the error is surfaced with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) | AppError::AuthError(_) | AppError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_)
            | AppError::RedisError(_)
            | AppError::EmailError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<lettre::error::Error> for AppError {
    fn from(err: lettre::error::Error) -> Self {
        AppError::EmailError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let status = self.status_code();
        let (error_message, details, retry_after) = match self {
            AppError::BadRequest(err) => (err.to_string(), None, None),
            AppError::NotFound(err) => (err.to_string(), None, None),
            AppError::Unauthorized(err) => (err.to_string(), None, None),
            AppError::Forbidden(err) => (err.to_string(), None, None),
            AppError::AuthError(err) => (err.to_string(), None, None),
            AppError::Conflict(err) => (err.to_string(), None, None),
            AppError::TooManyRequests(msg, retry) => (msg, None, retry),
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal server error");
                ("Internal server error".to_string(), None, None)
            }
            AppError::ServiceUnavailable => ("Service unavailable".to_string(), None, None),
            AppError::RedisError(err) => {
                tracing::error!(error = %err, "Cache error");
                ("Cache error".to_string(), None, None)
            }
            AppError::InvalidToken(err) => (
                "Invalid token".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::EmailError(msg) => ("Email error".to_string(), Some(msg), None),
            AppError::ConfigError(err) => (
                "Configuration error".to_string(),
                Some(err.to_string()),
                None,
            ),
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}
