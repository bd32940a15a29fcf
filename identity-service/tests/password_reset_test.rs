mod common;

use common::{link_token, TestApp, ALICE, NEW_PASSWORD, PASSWORD};
use identity_service::dtos::{ForgotPasswordResponse, RefreshRequest, ResetPasswordRequest};
use identity_service::models::{LinkPurpose, SecurityEventType, Status};
use identity_service::services::{LinkError, ServiceError};
use async_trait::async_trait;
use identity_service::services::{InMemoryStore, SharedStore, WindowAdmission};
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

fn refresh(token: &str) -> RefreshRequest {
    RefreshRequest {
        refresh_token: token.into(),
    }
}

/// Store whose revocation marker writes can be made to fail.
struct FlakyRevocationStore {
    inner: Arc<InMemoryStore>,
    failing: AtomicBool,
}

#[async_trait]
impl SharedStore for FlakyRevocationStore {
    async fn admit_in_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowAdmission, anyhow::Error> {
        self.inner.admit_in_window(key, limit, window).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        if key.starts_with("refresh:revoked_before:") && self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("store write refused");
        }
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        self.inner.exists(key).await
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.inner.health_check().await
    }
}

fn reset(token: &str, password: &str) -> ResetPasswordRequest {
    ResetPasswordRequest {
        token: token.into(),
        password: password.into(),
    }
}

#[tokio::test]
async fn test_unknown_identifier_gets_same_response_without_dispatch() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();

    let known = app
        .auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("known");
    assert_eq!(app.wait_for_links(1).await.len(), 1);

    let unknown = app
        .auth()
        .forgot_password(app.forgot_request("ghost@acme.test"), &ctx)
        .await
        .expect("unknown");
    assert_eq!(known, unknown);
    assert_eq!(unknown, ForgotPasswordResponse::default());
    assert_eq!(app.mailer.sent().len(), 1);

    let message = &app.mailer.sent()[0];
    assert_eq!(message.to, ALICE);
    assert_eq!(message.purpose, LinkPurpose::Reset);
    assert!(message
        .link
        .starts_with("https://app.acme.test/reset-password?token="));

    let requested = app.events_of(SecurityEventType::PasswordResetRequested).await;
    assert_eq!(requested.len(), 2);
}

#[tokio::test]
async fn test_suspended_principal_gets_no_link() {
    let app = TestApp::spawn().await;
    app.directory
        .update_principal(app.alice.principal_id, |p| p.status = Status::Suspended)
        .expect("suspend");

    let response = app
        .auth()
        .forgot_password(app.forgot_request(ALICE), &app.ctx())
        .await
        .expect("same response");
    assert_eq!(response, ForgotPasswordResponse::default());
    assert!(app.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_dispatch_failure_keeps_the_generic_response() {
    let app = TestApp::spawn().await;
    app.mailer.set_failing(true);

    let response = app
        .auth()
        .forgot_password(app.forgot_request(ALICE), &app.ctx())
        .await;
    assert!(matches!(response, Ok(r) if r == ForgotPasswordResponse::default()));
}

#[tokio::test]
async fn test_reset_then_login_with_new_secret() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();
    app.auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("forgot");

    app.auth()
        .reset_password(reset(&app.last_link_token().await, NEW_PASSWORD), &ctx)
        .await
        .expect("reset");

    let old = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &ctx)
        .await;
    assert!(matches!(old, Err(ServiceError::InvalidCredentials)));
    let new = app
        .auth()
        .login(app.login_request(ALICE, NEW_PASSWORD), &ctx)
        .await;
    assert!(new.is_ok());

    let completed = app.events_of(SecurityEventType::PasswordResetCompleted).await;
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn test_consumed_link_leaves_secret_untouched() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();
    app.auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("forgot");
    let token = app.last_link_token().await;

    app.auth()
        .reset_password(reset(&token, NEW_PASSWORD), &ctx)
        .await
        .expect("first reset");
    let hash_after_first = app
        .directory
        .stored_principal(app.alice.principal_id)
        .expect("principal")
        .secret_hash;

    let err = app
        .auth()
        .reset_password(reset(&token, "Another-Secret-77"), &ctx)
        .await
        .expect_err("second reset");
    assert!(matches!(err, ServiceError::Link(LinkError::AlreadyConsumed)));
    let app_error: AppError = err.into();
    assert_eq!(app_error.to_string(), "Bad request: Invalid or expired link");

    let hash_after_second = app
        .directory
        .stored_principal(app.alice.principal_id)
        .expect("principal")
        .secret_hash;
    assert_eq!(hash_after_first, hash_after_second);

    let rejected = app.events_of(SecurityEventType::PasswordResetRejected).await;
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].detail.contains("already consumed"));
}

#[tokio::test]
async fn test_expired_link_is_rejected() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();
    app.auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("forgot");
    let token = app.last_link_token().await;

    app.clock.advance(Duration::from_secs(31 * 60));
    let err = app
        .auth()
        .reset_password(reset(&token, NEW_PASSWORD), &ctx)
        .await
        .expect_err("expired");
    assert!(matches!(err, ServiceError::Link(LinkError::Expired)));

    let stored = app
        .directory
        .stored_principal(app.alice.principal_id)
        .expect("principal");
    assert_eq!(stored.secret_hash, app.alice.secret_hash);
}

#[tokio::test]
async fn test_weak_secret_does_not_spend_the_link() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();
    app.auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("forgot");
    let token = app.last_link_token().await;

    let err = app
        .auth()
        .reset_password(reset(&token, "short"), &ctx)
        .await
        .expect_err("policy");
    assert!(matches!(err, ServiceError::Validation(_)));

    app.auth()
        .reset_password(reset(&token, NEW_PASSWORD), &ctx)
        .await
        .expect("link still usable");
}

#[tokio::test]
async fn test_reset_revokes_outstanding_refresh_tokens() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();
    let before = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &ctx)
        .await
        .expect("login");

    app.auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("forgot");
    app.clock.advance_ms(1);
    app.auth()
        .reset_password(reset(&app.last_link_token().await, NEW_PASSWORD), &ctx)
        .await
        .expect("reset");

    let err = app
        .auth()
        .refresh(refresh(&before.refresh_token), &ctx)
        .await
        .expect_err("revoked");
    assert!(matches!(err, ServiceError::InvalidCredentials));

    // Sessions started after the reset are unaffected.
    let after = app
        .auth()
        .login(app.login_request(ALICE, NEW_PASSWORD), &ctx)
        .await
        .expect("login after reset");
    assert!(app
        .auth()
        .refresh(refresh(&after.refresh_token), &ctx)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_link_from_another_flow_is_rejected() {
    let app = TestApp::spawn().await;
    let ctx = app.ctx();
    app.auth()
        .issue_invite(
            &Default::default(),
            app.invite_request("newcomer@acme.test", None),
            &ctx,
        )
        .await
        .expect("invite");
    let invite_token = link_token(&app.mailer.sent()[0].link);

    let err = app
        .auth()
        .reset_password(reset(&invite_token, NEW_PASSWORD), &ctx)
        .await
        .expect_err("wrong purpose");
    assert!(matches!(err, ServiceError::Link(LinkError::WrongPurpose)));
}

#[tokio::test]
async fn test_failed_revocation_write_leaves_reset_undone() {
    let flaky = OnceLock::new();
    let app = TestApp::spawn_with_store(
        |_| {},
        |inner| {
            let store = Arc::new(FlakyRevocationStore {
                inner,
                failing: AtomicBool::new(true),
            });
            let _ = flaky.set(store.clone());
            store as Arc<dyn SharedStore>
        },
    )
    .await;
    let flaky = flaky.get().expect("store wrapped");
    let ctx = app.ctx();

    let before = app
        .auth()
        .login(app.login_request(ALICE, PASSWORD), &ctx)
        .await
        .expect("login");
    app.auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("forgot");
    let token = app.last_link_token().await;

    let err = app
        .auth()
        .reset_password(reset(&token, NEW_PASSWORD), &ctx)
        .await
        .expect_err("store down");
    assert!(matches!(err, ServiceError::ServiceUnavailable(_)));
    let stored = app
        .directory
        .stored_principal(app.alice.principal_id)
        .expect("principal");
    assert_eq!(stored.secret_hash, app.alice.secret_hash);

    // Nothing was spent, so the same link completes once the store recovers.
    flaky.failing.store(false, Ordering::SeqCst);
    app.clock.advance_ms(1);
    app.auth()
        .reset_password(reset(&token, NEW_PASSWORD), &ctx)
        .await
        .expect("retry");
    let err = app
        .auth()
        .refresh(refresh(&before.refresh_token), &ctx)
        .await
        .expect_err("revoked");
    assert!(matches!(err, ServiceError::InvalidCredentials));
}

#[tokio::test]
async fn test_forgot_password_does_not_wait_for_delivery() {
    let app = TestApp::spawn().await;
    app.mailer.set_delay(Duration::from_millis(150));
    let ctx = app.ctx();

    let started = Instant::now();
    let response = app
        .auth()
        .forgot_password(app.forgot_request(ALICE), &ctx)
        .await
        .expect("forgot");
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(response, ForgotPasswordResponse::default());
    assert!(app.mailer.sent().is_empty());

    assert_eq!(app.wait_for_links(1).await.len(), 1);
}
