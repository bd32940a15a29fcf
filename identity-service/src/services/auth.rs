//! Flow orchestrators.
//!
//! Each flow is a linear pipeline that stops at the first failure and
//! records exactly one security event for its outcome. The pipeline order is
//! scope, link verification, settings, admission, policy, link consumption,
//! side effects, permissions and finally tokens.

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;
use validator::Validate;

use super::clock::Clock;
use super::credentials::CredentialVerifier;
use super::directory::{AccessDirectory, IdentityDirectory};
use super::email::{LinkDispatcher, LinkMessage};
use super::error::{with_deadline, ServiceError};
use super::jwt::{AccessTokenClaims, TokenIssuer, TokenTriad};
use super::permissions::PermissionResolver;
use super::policy::PasswordPolicy;
use super::rate_limiter::{Admission, RateLimitClass, RateLimitRule, RateLimiter};
use super::security_audit::SecurityAuditService;
use super::signed_link::{IssuedLink, SignedLinkCodec};
use super::store::SharedStore;
use super::tenant_resolver::{ResolvedScope, ScopeRequest, TenantResolver};
use crate::config::{IdentityConfig, LinkConfig};
use crate::dtos::{
    AuthorizationDecision, ForgotPasswordRequest, ForgotPasswordResponse, InviteIssued,
    IssueInviteRequest, LoginRequest, LogoutRequest, RefreshRequest, RegisterInviteRequest,
    RegisterRequest, RegistrationOutcome, ResetPasswordRequest,
};
use crate::models::{
    LinkClaims, LinkPurpose, LinkSubject, NewPrincipal, Principal, PrincipalCreation,
    RequestContext, RoleAssignment, SecurityEvent, SecurityEventType, SecuritySettings, Severity,
    INVITE_ROLE_ATTRIBUTE,
};
use crate::utils::Password;
use crate::Collaborators;

const REFRESH_REVOCATION_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Login,
    Register,
    RegisterInvite,
    ForgotPassword,
    ResetPassword,
    IssueInvite,
    Refresh,
    Logout,
    Authorize,
}

impl Flow {
    fn as_str(self) -> &'static str {
        match self {
            Flow::Login => "login",
            Flow::Register => "register",
            Flow::RegisterInvite => "register_invite",
            Flow::ForgotPassword => "forgot_password",
            Flow::ResetPassword => "reset_password",
            Flow::IssueInvite => "issue_invite",
            Flow::Refresh => "refresh",
            Flow::Logout => "logout",
            Flow::Authorize => "authorize",
        }
    }

    fn succeeded(self) -> SecurityEventType {
        match self {
            Flow::Login => SecurityEventType::LoginSucceeded,
            Flow::Register => SecurityEventType::RegistrationSucceeded,
            Flow::RegisterInvite => SecurityEventType::InviteRedeemed,
            Flow::ForgotPassword => SecurityEventType::PasswordResetRequested,
            Flow::ResetPassword => SecurityEventType::PasswordResetCompleted,
            Flow::IssueInvite => SecurityEventType::InviteIssued,
            Flow::Refresh => SecurityEventType::TokenRefreshed,
            Flow::Logout => SecurityEventType::TokenRevoked,
            Flow::Authorize => SecurityEventType::AuthorizationGranted,
        }
    }

    fn failed(self) -> SecurityEventType {
        match self {
            Flow::Login => SecurityEventType::LoginFailed,
            Flow::Register => SecurityEventType::RegistrationFailed,
            Flow::RegisterInvite | Flow::IssueInvite => SecurityEventType::InviteRejected,
            Flow::ForgotPassword | Flow::ResetPassword => SecurityEventType::PasswordResetRejected,
            Flow::Refresh | Flow::Logout => SecurityEventType::TokenRefreshRejected,
            Flow::Authorize => SecurityEventType::AuthorizationDenied,
        }
    }
}

/// What one flow run learned, turned into its single event by `finish`.
struct FlowTrace<'a> {
    flow: Flow,
    ctx: &'a RequestContext,
    subject: Option<String>,
    tenant_id: Option<Uuid>,
    client_id: Option<String>,
    detail: Option<String>,
    limited: Option<RateLimitClass>,
    outcome: Option<(SecurityEventType, Severity)>,
}

impl<'a> FlowTrace<'a> {
    fn new(flow: Flow, ctx: &'a RequestContext) -> Self {
        Self {
            flow,
            ctx,
            subject: None,
            tenant_id: None,
            client_id: None,
            detail: None,
            limited: None,
            outcome: None,
        }
    }

    fn subject(&mut self, subject: impl Into<String>) {
        self.subject = Some(subject.into());
    }

    fn scope(&mut self, scope: &ResolvedScope) {
        self.tenant_id = Some(scope.tenant_id());
        self.client_id = Some(scope.client_id().to_string());
    }

    fn detail(&mut self, detail: impl Into<String>) {
        self.detail = Some(detail.into());
    }
}

/// Event type and severity for a failed flow. `None` when the failure was
/// already recorded where it happened.
fn classify(flow: Flow, err: &ServiceError) -> Option<(SecurityEventType, Severity)> {
    match err {
        ServiceError::TenantNotFound => None,
        ServiceError::RateLimited { .. } => Some((SecurityEventType::RateLimited, Severity::High)),
        ServiceError::ServiceUnavailable(_) => {
            Some((SecurityEventType::DependencyUnavailable, Severity::High))
        }
        ServiceError::TenantBoundaryViolation(_) => {
            Some((SecurityEventType::TenantBoundaryViolation, Severity::Critical))
        }
        ServiceError::AccessDenied(_) => Some((SecurityEventType::AccessDenied, Severity::High)),
        ServiceError::Link(_) => Some((flow.failed(), Severity::Medium)),
        ServiceError::Internal(_) => Some((flow.failed(), Severity::High)),
        ServiceError::InvalidCredentials
        | ServiceError::PrincipalNotFound
        | ServiceError::Validation(_)
        | ServiceError::Conflict(_) => Some((flow.failed(), Severity::Low)),
    }
}

fn validate<T: Validate>(request: &T) -> Result<(), ServiceError> {
    request
        .validate()
        .map_err(|e| ServiceError::Validation(e.to_string()))
}

fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Every flow that ends in tokens runs this first.
fn check_client_address(
    settings: &SecuritySettings,
    ctx: &RequestContext,
) -> Result<(), ServiceError> {
    if settings.ip.permits(ctx.client_ip) {
        Ok(())
    } else {
        Err(ServiceError::AccessDenied("client address not permitted".into()))
    }
}

fn awaiting_verification(settings: &SecuritySettings, principal: &Principal) -> bool {
    settings.general.require_verified_email && !principal.email_verified
}

fn revoked_before_key(principal_id: &str) -> String {
    format!("refresh:revoked_before:{}", principal_id)
}

fn refresh_used_key(jti: &str) -> String {
    format!("refresh:used:{}", jti)
}

#[derive(Clone)]
pub struct AuthService {
    identity: Arc<dyn IdentityDirectory>,
    access: Arc<dyn AccessDirectory>,
    store: Arc<dyn SharedStore>,
    dispatcher: Arc<dyn LinkDispatcher>,
    clock: Arc<dyn Clock>,
    audit: SecurityAuditService,
    resolver: TenantResolver,
    limiter: RateLimiter,
    links: SignedLinkCodec,
    credentials: CredentialVerifier,
    permissions: PermissionResolver,
    tokens: TokenIssuer,
    link_config: LinkConfig,
    default_settings: Arc<SecuritySettings>,
    timeout: Duration,
}

impl AuthService {
    pub fn new(
        config: &IdentityConfig,
        collaborators: &Collaborators,
        audit: SecurityAuditService,
    ) -> Result<Self, anyhow::Error> {
        let timeout = config.timeouts.dependency;
        Ok(Self {
            resolver: TenantResolver::new(collaborators.identity.clone(), audit.clone(), timeout),
            limiter: RateLimiter::new(collaborators.store.clone(), config.rate_limit, timeout),
            links: SignedLinkCodec::new(
                config.links.signing_secret.clone(),
                collaborators.store.clone(),
                collaborators.clock.clone(),
                timeout,
            ),
            credentials: CredentialVerifier::new(collaborators.identity.clone(), timeout)?,
            permissions: PermissionResolver::new(collaborators.access.clone(), timeout),
            tokens: TokenIssuer::new(&config.jwt, collaborators.clock.clone())?,
            identity: collaborators.identity.clone(),
            access: collaborators.access.clone(),
            store: collaborators.store.clone(),
            dispatcher: collaborators.dispatcher.clone(),
            clock: collaborators.clock.clone(),
            audit,
            link_config: config.links.clone(),
            default_settings: Arc::new(config.security.clone()),
            timeout,
        })
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn resolver(&self) -> &TenantResolver {
        &self.resolver
    }

    pub fn permissions(&self) -> &PermissionResolver {
        &self.permissions
    }

    /// Stateless check for the REST layer. Authorization decisions go
    /// through [`AuthService::authorize`], which re-resolves permissions.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        self.tokens.validate_access_token(token)
    }

    #[tracing::instrument(skip(self, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn login(
        &self,
        req: LoginRequest,
        ctx: &RequestContext,
    ) -> Result<TokenTriad, ServiceError> {
        let mut trace = FlowTrace::new(Flow::Login, ctx);
        let result = self.run_login(req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_login(
        &self,
        req: LoginRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<TokenTriad, ServiceError> {
        let email = normalize_identifier(&req.email);
        trace.subject(email.clone());
        validate(&req)?;

        let scope = self.resolver.resolve(&req.scope(), trace.ctx).await?;
        trace.scope(&scope);
        let settings = self.settings_for(&scope).await?;
        check_client_address(&settings, trace.ctx)?;

        let mut rule = self.limiter.rule(RateLimitClass::Login);
        if let Some(limit) = settings.threat.max_login_attempts {
            rule.limit = limit;
        }
        if let Some(window) = settings.threat.login_window_seconds {
            rule.window = Duration::from_secs(window);
        }
        self.admit(trace, RateLimitClass::Login, &scope, &email, Some(rule))
            .await?;

        let principal = self
            .credentials
            .verify(&scope, &email, &Password::new(req.password))
            .await
            .map_err(|e| {
                trace.detail(e.to_string());
                ServiceError::from(e)
            })?;
        trace.subject(principal.principal_id.to_string());

        // Same answer as a wrong secret; only the event tells them apart.
        if awaiting_verification(&settings, &principal) {
            trace.detail("email not verified");
            return Err(ServiceError::InvalidCredentials);
        }

        self.issue_tokens(&scope, &principal, &settings).await
    }

    #[tracing::instrument(skip(self, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn register(
        &self,
        req: RegisterRequest,
        ctx: &RequestContext,
    ) -> Result<RegistrationOutcome, ServiceError> {
        let mut trace = FlowTrace::new(Flow::Register, ctx);
        let result = self.run_register(req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_register(
        &self,
        req: RegisterRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<RegistrationOutcome, ServiceError> {
        let email = normalize_identifier(&req.email);
        trace.subject(email.clone());
        validate(&req)?;

        let scope = self.resolver.resolve(&req.scope(), trace.ctx).await?;
        trace.scope(&scope);
        let settings = self.settings_for(&scope).await?;
        if !settings.general.allow_self_registration {
            return Err(ServiceError::AccessDenied("self registration disabled".into()));
        }
        check_client_address(&settings, trace.ctx)?;

        self.admit(trace, RateLimitClass::Register, &scope, &email, None)
            .await?;

        PasswordPolicy::new(&settings.password)
            .validate(&req.password)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let password = Password::new(req.password);
        let secret_hash = self.credentials.hash_secret(&password).await?;
        let creation = with_deadline(
            self.timeout,
            "directory",
            self.identity.create_principal(NewPrincipal {
                tenant_id: scope.tenant_id(),
                email,
                secret_hash: secret_hash.into_string(),
                email_verified: false,
                display_name: req.display_name,
            }),
        )
        .await?;

        let (principal, created) = match creation {
            PrincipalCreation::Created(principal) => (principal, true),
            PrincipalCreation::Existing(principal) => {
                // A resubmit with the same secret continues where the first
                // attempt stopped; anything else is a conflict.
                if !self.credentials.matches(&principal, &password).await? {
                    return Err(ServiceError::Conflict("Identifier already registered".into()));
                }
                if !principal.is_active() {
                    trace.detail("principal not active");
                    return Err(ServiceError::InvalidCredentials);
                }
                trace.detail("idempotent resubmit");
                (principal, false)
            }
        };
        trace.subject(principal.principal_id.to_string());

        self.assign_roles(&scope, &principal, None).await?;
        let tokens = if awaiting_verification(&settings, &principal) {
            trace.detail(if created {
                "email verification required"
            } else {
                "idempotent resubmit, email verification required"
            });
            None
        } else {
            Some(self.issue_tokens(&scope, &principal, &settings).await?)
        };

        tracing::info!(principal_id = %principal.principal_id, tenant_id = %scope.tenant_id(), created, "Principal registered");
        Ok(RegistrationOutcome {
            principal_id: principal.principal_id,
            created,
            tokens,
        })
    }

    #[tracing::instrument(skip(self, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn register_with_invite(
        &self,
        req: RegisterInviteRequest,
        ctx: &RequestContext,
    ) -> Result<RegistrationOutcome, ServiceError> {
        let mut trace = FlowTrace::new(Flow::RegisterInvite, ctx);
        let result = self.run_register_invite(req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_register_invite(
        &self,
        req: RegisterInviteRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<RegistrationOutcome, ServiceError> {
        validate(&req)?;

        let claims = self.links.verify(&req.token, LinkPurpose::Invite).await?;
        let email = normalize_identifier(&claims.subject);
        trace.subject(email.clone());

        let scope = self.resolver.resolve_link(&claims, trace.ctx).await?;
        trace.scope(&scope);
        let settings = self.settings_for(&scope).await?;
        check_client_address(&settings, trace.ctx)?;

        self.admit(trace, RateLimitClass::Register, &scope, &email, None)
            .await?;

        PasswordPolicy::new(&settings.password)
            .validate(&req.password)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let invite_role = match claims.attribute(INVITE_ROLE_ATTRIBUTE) {
            Some(raw) => Some(self.invite_role(&scope, &claims, raw).await?),
            None => None,
        };

        let existing = with_deadline(
            self.timeout,
            "directory",
            self.identity
                .principal_by_identifier(scope.tenant_id(), &email),
        )
        .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict("Identifier already registered".into()));
        }

        // Every check has passed; from here on the link is spent.
        self.links.consume(&claims).await?;

        let password = Password::new(req.password);
        let secret_hash = self.credentials.hash_secret(&password).await?;
        let creation = with_deadline(
            self.timeout,
            "directory",
            self.identity.create_principal(NewPrincipal {
                tenant_id: scope.tenant_id(),
                email,
                secret_hash: secret_hash.into_string(),
                // The link was delivered to this address.
                email_verified: true,
                display_name: req.display_name,
            }),
        )
        .await?;
        let principal = match creation {
            PrincipalCreation::Created(principal) => principal,
            PrincipalCreation::Existing(_) => {
                return Err(ServiceError::Conflict("Identifier already registered".into()))
            }
        };
        trace.subject(principal.principal_id.to_string());

        self.assign_roles(&scope, &principal, invite_role).await?;
        let tokens = Some(self.issue_tokens(&scope, &principal, &settings).await?);

        tracing::info!(principal_id = %principal.principal_id, tenant_id = %scope.tenant_id(), "Invite redeemed");
        Ok(RegistrationOutcome {
            principal_id: principal.principal_id,
            created: true,
            tokens,
        })
    }

    /// Responds identically whether or not the identifier is known. Only a
    /// known, active principal gets a link.
    #[tracing::instrument(skip(self, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn forgot_password(
        &self,
        req: ForgotPasswordRequest,
        ctx: &RequestContext,
    ) -> Result<ForgotPasswordResponse, ServiceError> {
        let mut trace = FlowTrace::new(Flow::ForgotPassword, ctx);
        let result = self.run_forgot_password(req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_forgot_password(
        &self,
        req: ForgotPasswordRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<ForgotPasswordResponse, ServiceError> {
        let email = normalize_identifier(&req.email);
        trace.subject(email.clone());
        validate(&req)?;

        let scope = self.resolver.resolve(&req.scope(), trace.ctx).await?;
        trace.scope(&scope);

        self.admit(trace, RateLimitClass::ForgotPassword, &scope, &email, None)
            .await?;

        let principal = with_deadline(
            self.timeout,
            "directory",
            self.identity
                .principal_by_identifier(scope.tenant_id(), &email),
        )
        .await?;
        let Some(principal) = principal.filter(Principal::is_active) else {
            trace.detail("no active principal for identifier");
            return Ok(ForgotPasswordResponse::default());
        };
        trace.subject(principal.principal_id.to_string());

        let issued = self.links.issue(
            LinkPurpose::Reset,
            LinkSubject::new(
                principal.principal_id.to_string(),
                scope.tenant_id(),
                Some(scope.client_id().to_string()),
            ),
            self.link_config.reset_ttl,
        )?;

        // Delivery runs detached so the response does not wait on the mailer.
        let message = self.link_message(&principal.email, &scope, &issued, "reset-password");
        let dispatcher = self.dispatcher.clone();
        let timeout = self.timeout;
        let principal_id = principal.principal_id;
        tokio::spawn(
            async move {
                match with_deadline(timeout, "link_dispatcher", dispatcher.dispatch(&message)).await {
                    Ok(()) => tracing::debug!(%principal_id, "Reset link dispatched"),
                    Err(e) => {
                        metrics::counter!("identity_link_dispatch_failed_total", "purpose" => "reset")
                            .increment(1);
                        tracing::error!(%principal_id, error = %e, "Reset link dispatch failed");
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
        trace.detail("reset link queued");

        Ok(ForgotPasswordResponse::default())
    }

    #[tracing::instrument(skip(self, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn reset_password(
        &self,
        req: ResetPasswordRequest,
        ctx: &RequestContext,
    ) -> Result<(), ServiceError> {
        let mut trace = FlowTrace::new(Flow::ResetPassword, ctx);
        let result = self.run_reset_password(req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_reset_password(
        &self,
        req: ResetPasswordRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<(), ServiceError> {
        validate(&req)?;

        let claims = self.links.verify(&req.token, LinkPurpose::Reset).await?;
        trace.subject(claims.subject.clone());
        let principal_id = Uuid::parse_str(&claims.subject)
            .map_err(|_| ServiceError::Link(super::signed_link::LinkError::Malformed))?;

        let scope = self.resolver.resolve_link(&claims, trace.ctx).await?;
        trace.scope(&scope);
        let settings = self.settings_for(&scope).await?;

        self.admit(
            trace,
            RateLimitClass::ResetPassword,
            &scope,
            &claims.subject,
            None,
        )
        .await?;

        PasswordPolicy::new(&settings.password)
            .validate(&req.password)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let principal = with_deadline(
            self.timeout,
            "directory",
            self.identity.principal_by_id(scope.tenant_id(), principal_id),
        )
        .await?
        .filter(Principal::is_active)
        .ok_or(ServiceError::PrincipalNotFound)?;

        // Every refresh token issued before now stops working. The marker
        // goes first so a failed write leaves the link and secret untouched.
        let now_ms = self.clock.now_ms();
        let ttl = Duration::from_secs(self.tokens.max_refresh_ttl_secs(&settings.session) as u64)
            + REFRESH_REVOCATION_GRACE;
        with_deadline(
            self.timeout,
            "token_store",
            self.store.set(
                &revoked_before_key(&claims.subject),
                &now_ms.to_string(),
                ttl,
            ),
        )
        .await?;

        self.links.consume(&claims).await?;

        let secret_hash = self
            .credentials
            .hash_secret(&Password::new(req.password))
            .await?;
        with_deadline(
            self.timeout,
            "directory",
            self.identity.update_secret(
                scope.tenant_id(),
                principal.principal_id,
                secret_hash.into_string(),
            ),
        )
        .await?;

        tracing::info!(principal_id = %principal.principal_id, tenant_id = %scope.tenant_id(), "Password reset");
        Ok(())
    }

    /// Mints and delivers an invite for an identifier not yet registered in
    /// the tenant.
    #[tracing::instrument(skip(self, scope, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn issue_invite(
        &self,
        scope: &ScopeRequest,
        req: IssueInviteRequest,
        ctx: &RequestContext,
    ) -> Result<InviteIssued, ServiceError> {
        let mut trace = FlowTrace::new(Flow::IssueInvite, ctx);
        let result = self.run_issue_invite(scope, req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_issue_invite(
        &self,
        scope: &ScopeRequest,
        req: IssueInviteRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<InviteIssued, ServiceError> {
        let email = normalize_identifier(&req.email);
        trace.subject(email.clone());
        validate(&req)?;

        let scope = self.resolver.resolve(scope, trace.ctx).await?;
        trace.scope(&scope);

        let ttl = req
            .ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.link_config.invite_ttl);
        if ttl > self.link_config.max_invite_ttl {
            return Err(ServiceError::Validation("Invite TTL exceeds the maximum".into()));
        }

        let existing = with_deadline(
            self.timeout,
            "directory",
            self.identity
                .principal_by_identifier(scope.tenant_id(), &email),
        )
        .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict("Identifier already registered".into()));
        }

        let mut subject = LinkSubject::new(
            email.clone(),
            scope.tenant_id(),
            Some(scope.client_id().to_string()),
        );
        if let Some(role_id) = req.role_id {
            let role = with_deadline(
                self.timeout,
                "access_directory",
                self.access.role_by_id(scope.tenant_id(), role_id),
            )
            .await?;
            match role {
                Some(role) if role.is_active() => {
                    subject = subject.with_attribute(INVITE_ROLE_ATTRIBUTE, role_id.to_string());
                }
                _ => return Err(ServiceError::Validation("Unknown role for tenant".into())),
            }
        }

        let issued = self.links.issue(LinkPurpose::Invite, subject, ttl)?;
        let message = self.link_message(&email, &scope, &issued, "accept-invite");
        with_deadline(self.timeout, "link_dispatcher", self.dispatcher.dispatch(&message)).await?;

        tracing::info!(tenant_id = %scope.tenant_id(), "Invite issued");
        Ok(InviteIssued {
            email,
            expires_at: message.expires_at,
        })
    }

    /// Rotates a refresh token. Each refresh token works once.
    #[tracing::instrument(skip(self, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn refresh(
        &self,
        req: RefreshRequest,
        ctx: &RequestContext,
    ) -> Result<TokenTriad, ServiceError> {
        let mut trace = FlowTrace::new(Flow::Refresh, ctx);
        let result = self.run_refresh(req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_refresh(
        &self,
        req: RefreshRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<TokenTriad, ServiceError> {
        validate(&req)?;

        let claims = self
            .tokens
            .validate_refresh_token(&req.refresh_token)
            .inspect_err(|_| trace.detail("refresh token rejected"))?;
        trace.subject(claims.sub.clone());

        let scope = self
            .resolver
            .resolve(
                &ScopeRequest::new(Some(claims.tid), Some(claims.cid.clone())),
                trace.ctx,
            )
            .await?;
        trace.scope(&scope);
        let settings = self.settings_for(&scope).await?;
        check_client_address(&settings, trace.ctx)?;

        let revoked_before = with_deadline(
            self.timeout,
            "token_store",
            self.store.get(&revoked_before_key(&claims.sub)),
        )
        .await?
        .and_then(|raw| raw.parse::<i64>().ok());
        if revoked_before.is_some_and(|cutoff| claims.iat_ms < cutoff) {
            trace.detail("refresh token revoked by password reset");
            return Err(ServiceError::InvalidCredentials);
        }

        let remaining = (claims.exp - self.clock.now().timestamp()).max(0) as u64;
        let first_use = with_deadline(
            self.timeout,
            "token_store",
            self.store.set_if_absent(
                &refresh_used_key(&claims.jti),
                &claims.sub,
                Duration::from_secs(remaining) + REFRESH_REVOCATION_GRACE,
            ),
        )
        .await?;
        if !first_use {
            tracing::warn!(principal_id = %claims.sub, "Refresh token reuse");
            trace.detail("refresh token reuse");
            return Err(ServiceError::InvalidCredentials);
        }

        let principal_id =
            Uuid::parse_str(&claims.sub).map_err(|_| ServiceError::InvalidCredentials)?;
        let principal = with_deadline(
            self.timeout,
            "directory",
            self.identity.principal_by_id(scope.tenant_id(), principal_id),
        )
        .await?
        .filter(Principal::is_active)
        .ok_or_else(|| {
            trace.detail("principal missing or not active");
            ServiceError::InvalidCredentials
        })?;
        if awaiting_verification(&settings, &principal) {
            trace.detail("email not verified");
            return Err(ServiceError::InvalidCredentials);
        }

        self.issue_tokens(&scope, &principal, &settings).await
    }

    /// Revokes a refresh token. Revoking twice is not an error.
    #[tracing::instrument(skip(self, req, ctx), fields(request_id = %ctx.request_id))]
    pub async fn logout(&self, req: LogoutRequest, ctx: &RequestContext) -> Result<(), ServiceError> {
        let mut trace = FlowTrace::new(Flow::Logout, ctx);
        let result = self.run_logout(req, &mut trace).await;
        self.finish(trace, result)
    }

    async fn run_logout(
        &self,
        req: LogoutRequest,
        trace: &mut FlowTrace<'_>,
    ) -> Result<(), ServiceError> {
        validate(&req)?;
        let claims = self
            .tokens
            .validate_refresh_token(&req.refresh_token)
            .inspect_err(|_| trace.detail("refresh token rejected"))?;
        trace.subject(claims.sub.clone());
        trace.tenant_id = Some(claims.tid);
        trace.client_id = Some(claims.cid.clone());

        let remaining = (claims.exp - self.clock.now().timestamp()).max(0) as u64;
        let newly_revoked = with_deadline(
            self.timeout,
            "token_store",
            self.store.set_if_absent(
                &refresh_used_key(&claims.jti),
                &claims.sub,
                Duration::from_secs(remaining) + REFRESH_REVOCATION_GRACE,
            ),
        )
        .await?;
        if !newly_revoked {
            trace.detail("refresh token already spent");
        }
        Ok(())
    }

    /// Re-resolves the principal's permissions live; the token only proves
    /// identity and scope.
    #[tracing::instrument(skip(self, access_token, ctx), fields(request_id = %ctx.request_id))]
    pub async fn authorize(
        &self,
        access_token: &str,
        permission: &str,
        api_id: Option<Uuid>,
        ctx: &RequestContext,
    ) -> Result<AuthorizationDecision, ServiceError> {
        let mut trace = FlowTrace::new(Flow::Authorize, ctx);
        let result = self
            .run_authorize(access_token, permission, api_id, &mut trace)
            .await;
        self.finish(trace, result)
    }

    async fn run_authorize(
        &self,
        access_token: &str,
        permission: &str,
        api_id: Option<Uuid>,
        trace: &mut FlowTrace<'_>,
    ) -> Result<AuthorizationDecision, ServiceError> {
        let claims = self
            .tokens
            .validate_access_token(access_token)
            .inspect_err(|_| trace.detail("access token rejected"))?;
        trace.subject(claims.sub.clone());

        let scope = self
            .resolver
            .resolve(
                &ScopeRequest::new(Some(claims.tid), Some(claims.cid.clone())),
                trace.ctx,
            )
            .await?;
        trace.scope(&scope);

        let principal_id =
            Uuid::parse_str(&claims.sub).map_err(|_| ServiceError::InvalidCredentials)?;
        let principal = with_deadline(
            self.timeout,
            "directory",
            self.identity.principal_by_id(scope.tenant_id(), principal_id),
        )
        .await?
        .filter(Principal::is_active)
        .ok_or_else(|| {
            trace.detail("principal missing or not active");
            ServiceError::InvalidCredentials
        })?;

        let granted = self
            .permissions
            .has_permission(&scope, &principal, permission, api_id)
            .await?;

        let target = match api_id {
            Some(api) => format!("{permission} on api {api}"),
            None => permission.to_string(),
        };
        if granted {
            trace.detail(format!("granted {target}"));
        } else {
            trace.detail(format!("missing {target}"));
            trace.outcome = Some((SecurityEventType::AuthorizationDenied, Severity::Medium));
        }

        Ok(AuthorizationDecision {
            principal_id,
            tenant_id: scope.tenant_id(),
            permission: permission.to_string(),
            api_id,
            granted,
        })
    }

    async fn settings_for(&self, scope: &ResolvedScope) -> Result<SecuritySettings, ServiceError> {
        let settings = with_deadline(
            self.timeout,
            "directory",
            self.identity.security_settings(scope.tenant_id()),
        )
        .await?;
        Ok(settings.unwrap_or_else(|| (*self.default_settings).clone()))
    }

    async fn admit(
        &self,
        trace: &mut FlowTrace<'_>,
        class: RateLimitClass,
        scope: &ResolvedScope,
        identifier: &str,
        rule: Option<RateLimitRule>,
    ) -> Result<(), ServiceError> {
        let key = format!("{}:{}", scope.tenant_id(), identifier);
        let admission = match rule {
            Some(rule) => self.limiter.admit_with_rule(class, &key, rule).await?,
            None => self.limiter.admit(class, &key).await?,
        };
        match admission {
            Admission::Allowed { .. } => Ok(()),
            Admission::Denied { retry_after } => {
                trace.limited = Some(class);
                trace.detail(format!("{} threshold reached", class.as_str()));
                Err(ServiceError::RateLimited {
                    retry_after_secs: retry_after_secs(retry_after),
                })
            }
        }
    }

    async fn invite_role(
        &self,
        scope: &ResolvedScope,
        claims: &LinkClaims,
        raw: &str,
    ) -> Result<Uuid, ServiceError> {
        let role_id = Uuid::parse_str(raw)
            .map_err(|_| ServiceError::Link(super::signed_link::LinkError::Malformed))?;
        let role = with_deadline(
            self.timeout,
            "access_directory",
            self.access.role_by_id(scope.tenant_id(), role_id),
        )
        .await?;
        match role {
            Some(role) if role.is_active() => Ok(role_id),
            Some(_) => Err(ServiceError::Validation("Invited role is no longer active".into())),
            None => Err(ServiceError::TenantBoundaryViolation(format!(
                "invite {} names role {} outside tenant {}",
                claims.nonce,
                role_id,
                scope.tenant_id()
            ))),
        }
    }

    async fn assign_roles(
        &self,
        scope: &ResolvedScope,
        principal: &Principal,
        extra: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let defaults = with_deadline(
            self.timeout,
            "access_directory",
            self.access.default_roles(scope.tenant_id()),
        )
        .await?;
        let role_ids = defaults
            .into_iter()
            .filter(|role| role.tenant_id == scope.tenant_id())
            .map(|role| role.role_id)
            .chain(extra);
        for role_id in role_ids {
            with_deadline(
                self.timeout,
                "access_directory",
                self.access.assign_role(RoleAssignment {
                    tenant_id: scope.tenant_id(),
                    principal_id: principal.principal_id,
                    role_id,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn issue_tokens(
        &self,
        scope: &ResolvedScope,
        principal: &Principal,
        settings: &SecuritySettings,
    ) -> Result<TokenTriad, ServiceError> {
        let permissions = self.permissions.resolve(scope, principal).await?;
        self.tokens
            .issue(principal, scope, Some(&permissions), &settings.session)
    }

    fn link_message(
        &self,
        to: &str,
        scope: &ResolvedScope,
        issued: &IssuedLink,
        path: &str,
    ) -> LinkMessage {
        let expires_at = chrono::DateTime::from_timestamp_millis(issued.claims.exp)
            .unwrap_or_else(|| self.clock.now());
        LinkMessage {
            to: to.to_string(),
            purpose: issued.claims.purpose,
            link: format!(
                "{}/{}?token={}",
                self.link_config.base_url.trim_end_matches('/'),
                path,
                issued.token
            ),
            expires_at,
            tenant_id: scope.tenant_id(),
        }
    }

    fn finish<T>(&self, trace: FlowTrace<'_>, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        let flow = trace.flow;
        let (event, outcome) = match &result {
            Ok(_) => (
                Some(trace.outcome.unwrap_or((flow.succeeded(), Severity::Info))),
                "success",
            ),
            Err(e) => (classify(flow, e), e.kind()),
        };

        metrics::counter!("identity_flow_total", "flow" => flow.as_str(), "outcome" => outcome)
            .increment(1);
        if let Some(class) = trace.limited {
            metrics::counter!("identity_rate_limited_total", "class" => class.as_str()).increment(1);
        }

        if let Err(e) = &result {
            if e.is_retryable() || matches!(e, ServiceError::Internal(_)) {
                tracing::warn!(flow = flow.as_str(), error = %e, "Flow failed");
            } else {
                tracing::info!(flow = flow.as_str(), error = %e, "Flow rejected");
            }
        }

        if let Some((event_type, severity)) = event {
            let detail = match (&trace.detail, &result) {
                (Some(detail), Err(e)) => format!("{e}: {detail}"),
                (Some(detail), Ok(_)) => detail.clone(),
                (None, Err(e)) => e.to_string(),
                (None, Ok(_)) => String::new(),
            };
            self.audit.record(
                SecurityEvent::new(event_type, severity, trace.ctx)
                    .subject(trace.subject)
                    .tenant(trace.tenant_id, trace.client_id)
                    .detail(detail),
            );
        }

        result
    }
}
