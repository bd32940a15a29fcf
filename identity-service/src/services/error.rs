use service_core::error::AppError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use super::signed_link::LinkError;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Tenant or client missing, inactive, or not belonging together.
    #[error("Tenant scope could not be resolved")]
    TenantNotFound,

    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Link rejected: {0}")]
    Link(#[from] LinkError),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Tenant boundary violation: {0}")]
    TenantBoundaryViolation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Short label used as the metrics outcome.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::TenantNotFound => "tenant_not_found",
            ServiceError::PrincipalNotFound => "principal_not_found",
            ServiceError::InvalidCredentials => "invalid_credentials",
            ServiceError::Link(_) => "invalid_link",
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::ServiceUnavailable(_) => "unavailable",
            ServiceError::TenantBoundaryViolation(_) => "boundary_violation",
            ServiceError::AccessDenied(_) => "access_denied",
            ServiceError::Validation(_) => "validation",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::ServiceUnavailable(_) | ServiceError::RateLimited { .. })
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            // Missing tenant, client and principal look the same from outside.
            ServiceError::TenantNotFound | ServiceError::PrincipalNotFound => {
                AppError::NotFound(anyhow::anyhow!("Unable to process request"))
            }
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::Link(_) => AppError::BadRequest(anyhow::anyhow!("Invalid or expired link")),
            ServiceError::RateLimited { retry_after_secs } => AppError::TooManyRequests(
                "Too many requests, please try again later".to_string(),
                Some(retry_after_secs),
            ),
            ServiceError::ServiceUnavailable(_) => AppError::ServiceUnavailable,
            ServiceError::TenantBoundaryViolation(_) | ServiceError::AccessDenied(_) => {
                AppError::Forbidden(anyhow::anyhow!("Access denied"))
            }
            ServiceError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

/// Runs a collaborator call under a deadline. Both a failed and an elapsed
/// call surface as `ServiceUnavailable`.
pub(crate) async fn with_deadline<T, F>(
    limit: Duration,
    dependency: &'static str,
    fut: F,
) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, anyhow::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::warn!(dependency, error = %e, "Dependency call failed");
            Err(ServiceError::ServiceUnavailable(format!("{dependency} failed")))
        }
        Err(_) => {
            tracing::warn!(
                dependency,
                timeout_ms = limit.as_millis() as u64,
                "Dependency call timed out"
            );
            Err(ServiceError::ServiceUnavailable(format!("{dependency} timed out")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn test_link_reasons_share_one_message() {
        for reason in [
            LinkError::InvalidSignature,
            LinkError::Expired,
            LinkError::AlreadyConsumed,
            LinkError::Malformed,
            LinkError::WrongPurpose,
        ] {
            let app: AppError = ServiceError::Link(reason).into();
            assert_eq!(app.status_code(), StatusCode::BAD_REQUEST);
            assert_eq!(app.to_string(), "Bad request: Invalid or expired link");
        }
    }

    #[test]
    fn test_scope_and_principal_failures_indistinguishable() {
        let a: AppError = ServiceError::TenantNotFound.into();
        let b: AppError = ServiceError::PrincipalNotFound.into();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let app: AppError = ServiceError::RateLimited { retry_after_secs: 30 }.into();
        assert_eq!(app.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(matches!(app, AppError::TooManyRequests(_, Some(30))));
    }

    #[test]
    fn test_boundary_violation_fails_closed() {
        let app: AppError = ServiceError::TenantBoundaryViolation("role".into()).into();
        assert_eq!(app.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_deadline_elapsed_is_unavailable() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, anyhow::Error>(1)
        };
        let err = with_deadline(Duration::from_millis(10), "directory", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ServiceUnavailable(_)));
    }
}
