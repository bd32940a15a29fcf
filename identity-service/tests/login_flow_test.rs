mod common;

use common::{TestApp, ALICE, PASSWORD, READ_PERMISSION};
use identity_service::models::{
    IpSettings, RoleAssignment, SecurityEventType, Severity, Status,
};
use identity_service::services::ServiceError;
use service_core::error::AppError;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[tokio::test]
async fn test_login_issues_token_triad() {
    let app = TestApp::spawn().await;
    let triad = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &app.ctx())
        .await
        .expect("login");

    assert!(!triad.refresh_token.is_empty());
    assert!(triad.id_token.is_some());
    assert_eq!(triad.token_type, "Bearer");
    assert!(triad.expires_in <= app.state.config.jwt.max_access_token_minutes * 60);

    let claims = app
        .auth()
        .validate_access_token(&triad.access_token)
        .expect("access token");
    assert_eq!(claims.sub, app.alice.principal_id.to_string());
    assert_eq!(claims.tid, app.tenant.tenant_id);
    assert_eq!(claims.scope.as_deref(), Some(READ_PERMISSION));

    let id = app
        .auth()
        .tokens()
        .validate_id_token(triad.id_token.as_deref().unwrap_or_default(), &app.client.client_id)
        .expect("id token");
    assert_eq!(id.email, ALICE);

    let events = app.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SecurityEventType::LoginSucceeded);
    assert_eq!(events[0].subject_id, Some(app.alice.principal_id.to_string()));
    assert_eq!(events[0].client_ip.as_deref(), Some("203.0.113.7"));
}

#[tokio::test]
async fn test_login_accepts_identifier_in_any_case() {
    let app = TestApp::spawn().await;
    let result = app
        .auth()
        .login(app.login_request("  ALICE@acme.test", PASSWORD), &app.ctx())
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_access_ttl_is_capped_by_tenant_session_settings() {
    let app = TestApp::spawn().await;
    let mut settings = app.state.config.security.clone();
    settings.session.access_token_minutes = Some(600);
    app.directory
        .set_security_settings(app.tenant.tenant_id, settings)
        .expect("settings");

    let triad = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &app.ctx())
        .await
        .expect("login");
    assert_eq!(triad.expires_in, 60 * 60);
}

#[tokio::test]
async fn test_unknown_identifier_and_wrong_secret_look_identical() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();

    let unknown = app
        .auth()
        .login(app.login_request("nobody@acme.test", PASSWORD), &ctx)
        .await
        .expect_err("unknown identifier");
    let wrong = app
        .auth()
        .login(app.login_request(ALICE, "Not-The-Password-1"), &ctx)
        .await
        .expect_err("wrong secret");

    assert!(matches!(unknown, ServiceError::InvalidCredentials));
    assert!(matches!(wrong, ServiceError::InvalidCredentials));
    let unknown: AppError = unknown.into();
    let wrong: AppError = wrong.into();
    assert_eq!(unknown.to_string(), wrong.to_string());

    // The audit trail keeps the distinction.
    let failures = app.events_of(SecurityEventType::LoginFailed).await;
    assert_eq!(failures.len(), 2);
    assert!(failures[0].detail.contains("unknown principal"));
    assert!(failures[1].detail.contains("wrong secret"));
}

#[tokio::test]
async fn test_suspended_principal_cannot_login() {
    let app = TestApp::spawn().await;
    app.directory
        .update_principal(app.alice.principal_id, |p| p.status = Status::Suspended)
        .expect("suspend");

    let err = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &app.ctx())
        .await
        .expect_err("suspended");
    assert!(matches!(err, ServiceError::InvalidCredentials));
}

#[tokio::test]
async fn test_blocked_address_is_denied() {
    let app = TestApp::spawn().await;
    let mut settings = app.state.config.security.clone();
    settings.ip = IpSettings {
        blocked: vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))],
        allowed: Vec::new(),
    };
    app.directory
        .set_security_settings(app.tenant.tenant_id, settings)
        .expect("settings");

    let err = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &app.ctx())
        .await
        .expect_err("blocked");
    assert!(matches!(err, ServiceError::AccessDenied(_)));

    let denied = app.events_of(SecurityEventType::AccessDenied).await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].severity, Severity::High);
}

#[tokio::test]
async fn test_slow_directory_is_unavailable_not_invalid() {
    let app = TestApp::spawn().await;
    app.directory.set_latency(Duration::from_millis(500));

    let err = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &app.ctx())
        .await
        .expect_err("timed out");
    assert!(matches!(err, ServiceError::ServiceUnavailable(_)));
    assert!(err.is_retryable());

    let events = app.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SecurityEventType::DependencyUnavailable);
    assert_eq!(events[0].severity, Severity::High);
}

#[tokio::test]
async fn test_authorization_is_resolved_live() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();
    let triad = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &ctx)
        .await
        .expect("login");

    let decision = app
        .auth()
        .authorize(&triad.access_token, READ_PERMISSION, None, &ctx)
        .await
        .expect("authorize");
    assert!(decision.granted);

    app.directory
        .revoke_role(&RoleAssignment {
            tenant_id: app.tenant.tenant_id,
            principal_id: app.alice.principal_id,
            role_id: app.member_role.role_id,
        })
        .expect("revoke");

    // Same token, new answer.
    let decision = app
        .auth()
        .authorize(&triad.access_token, READ_PERMISSION, None, &ctx)
        .await
        .expect("authorize");
    assert!(!decision.granted);

    let denied = app.events_of(SecurityEventType::AuthorizationDenied).await;
    assert_eq!(denied.len(), 1);
}

#[tokio::test]
async fn test_principal_without_roles_has_no_permissions() {
    let app = TestApp::spawn().await;
    app.directory
        .revoke_role(&RoleAssignment {
            tenant_id: app.tenant.tenant_id,
            principal_id: app.alice.principal_id,
            role_id: app.member_role.role_id,
        })
        .expect("revoke");

    let triad = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &app.ctx())
        .await
        .expect("login still succeeds");
    let claims = app
        .auth()
        .validate_access_token(&triad.access_token)
        .expect("access token");
    assert!(claims.scope.is_none());
}

#[tokio::test]
async fn test_garbage_access_token_is_rejected() {
    let app = TestApp::spawn().await;
    let err = app
        .auth()
        .authorize("not-a-token", READ_PERMISSION, None, &app.ctx())
        .await
        .expect_err("garbage");
    assert!(matches!(err, ServiceError::InvalidCredentials));
}

#[tokio::test]
async fn test_unverified_email_answers_like_wrong_secret() {
    let app = TestApp::spawn().await;
    app.require_verified_email();
    app.directory
        .update_principal(app.alice.principal_id, |p| p.email_verified = false)
        .expect("unverify");
    let ctx = app.ctx();

    let unverified = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &ctx)
        .await
        .expect_err("unverified");
    let wrong = app
        .auth()
        .login(app.login_request(ALICE, "Not-The-Secret-1"), &ctx)
        .await
        .expect_err("wrong secret");
    assert!(matches!(unverified, ServiceError::InvalidCredentials));
    assert_eq!(unverified.to_string(), wrong.to_string());

    let failures = app.events_of(SecurityEventType::LoginFailed).await;
    assert_eq!(failures.len(), 2);
    assert!(failures[0].detail.contains("email not verified"));
    assert!(app.events_of(SecurityEventType::AccessDenied).await.is_empty());
}
