use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::services::jwt::TokenTriad;
use crate::services::tenant_resolver::ScopeRequest;

// Requests carrying secrets do not derive Debug.

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    pub tenant_id: Option<Uuid>,
    pub client_id: Option<String>,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    #[validate(length(min = 1, max = 1024, message = "Password is required"))]
    pub password: String,
}

#[derive(Deserialize, Validate)]
pub struct RegisterRequest {
    pub tenant_id: Option<Uuid>,
    pub client_id: Option<String>,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    #[validate(length(min = 1, max = 1024, message = "Password is required"))]
    pub password: String,

    #[validate(length(max = 200, message = "Display name is too long"))]
    pub display_name: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct RegisterInviteRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,

    #[validate(length(min = 1, max = 1024, message = "Password is required"))]
    pub password: String,

    #[validate(length(max = 200, message = "Display name is too long"))]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ForgotPasswordRequest {
    pub tenant_id: Option<Uuid>,
    pub client_id: Option<String>,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,
}

#[derive(Deserialize, Validate)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,

    #[validate(length(min = 1, max = 1024, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IssueInviteRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    /// Role granted on redemption, in addition to the tenant's default roles.
    pub role_id: Option<Uuid>,

    #[validate(range(min = 60, message = "Invite TTL must be at least 60 seconds"))]
    pub ttl_seconds: Option<u64>,
}

#[derive(Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Deserialize, Validate)]
pub struct LogoutRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

macro_rules! scoped {
    ($($request:ty),*) => {
        $(impl $request {
            pub fn scope(&self) -> ScopeRequest {
                ScopeRequest::new(self.tenant_id, self.client_id.clone())
            }
        })*
    };
}

scoped!(LoginRequest, RegisterRequest, ForgotPasswordRequest);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ForgotPasswordResponse {
    pub message: String,
}

impl Default for ForgotPasswordResponse {
    fn default() -> Self {
        Self {
            message: "If an account exists for this address, a reset link has been sent."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationOutcome {
    pub principal_id: Uuid,
    /// False when an identical earlier submission already created the principal.
    pub created: bool,
    /// Absent while the tenant requires a verified email the principal
    /// does not have yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenTriad>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InviteIssued {
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub principal_id: Uuid,
    pub tenant_id: Uuid,
    pub permission: String,
    pub api_id: Option<Uuid>,
    pub granted: bool,
}
