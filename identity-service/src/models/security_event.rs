//! Security event model - append-only records of every security decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RequestContext;

/// Security event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    LoginSucceeded,
    LoginFailed,
    RegistrationSucceeded,
    RegistrationFailed,
    InviteIssued,
    InviteRedeemed,
    InviteRejected,
    PasswordResetRequested,
    PasswordResetCompleted,
    PasswordResetRejected,
    TokenRefreshed,
    TokenRefreshRejected,
    TokenRevoked,
    AuthorizationGranted,
    AuthorizationDenied,
    RateLimited,
    ScopeResolutionFailed,
    TenantBoundaryViolation,
    AccessDenied,
    DependencyUnavailable,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::LoginSucceeded => "login_succeeded",
            SecurityEventType::LoginFailed => "login_failed",
            SecurityEventType::RegistrationSucceeded => "registration_succeeded",
            SecurityEventType::RegistrationFailed => "registration_failed",
            SecurityEventType::InviteIssued => "invite_issued",
            SecurityEventType::InviteRedeemed => "invite_redeemed",
            SecurityEventType::InviteRejected => "invite_rejected",
            SecurityEventType::PasswordResetRequested => "password_reset_requested",
            SecurityEventType::PasswordResetCompleted => "password_reset_completed",
            SecurityEventType::PasswordResetRejected => "password_reset_rejected",
            SecurityEventType::TokenRefreshed => "token_refreshed",
            SecurityEventType::TokenRefreshRejected => "token_refresh_rejected",
            SecurityEventType::TokenRevoked => "token_revoked",
            SecurityEventType::AuthorizationGranted => "authorization_granted",
            SecurityEventType::AuthorizationDenied => "authorization_denied",
            SecurityEventType::RateLimited => "rate_limited",
            SecurityEventType::ScopeResolutionFailed => "scope_resolution_failed",
            SecurityEventType::TenantBoundaryViolation => "tenant_boundary_violation",
            SecurityEventType::AccessDenied => "access_denied",
            SecurityEventType::DependencyUnavailable => "dependency_unavailable",
        }
    }
}

/// Severity levels, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Security event record. Field names are consumed by downstream alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub event_type: SecurityEventType,
    pub subject_id: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
    pub severity: Severity,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, ctx: &RequestContext) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            subject_id: None,
            tenant_id: None,
            client_id: None,
            client_ip: ctx.client_ip.map(|ip| ip.to_string()),
            user_agent: ctx.user_agent.clone(),
            request_id: ctx.request_id.clone(),
            timestamp: Utc::now(),
            detail: String::new(),
            severity,
        }
    }

    pub fn subject(mut self, subject_id: Option<String>) -> Self {
        self.subject_id = subject_id;
        self
    }

    pub fn tenant(mut self, tenant_id: Option<Uuid>, client_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self.client_id = client_id;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}
