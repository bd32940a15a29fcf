//! Shared harness for identity-service integration tests.
//!
//! Every collaborator is in memory: the directory, the shared store (on a
//! manual clock), the link dispatcher and the audit sink.

#![allow(dead_code)]

use identity_service::{
    build_state,
    config::{
        Environment, IdentityConfig, JwtConfig, JwtSigningKey, LinkConfig, RateLimitConfig,
        RedisConfig, TimeoutConfig,
    },
    dtos::{ForgotPasswordRequest, IssueInviteRequest, LoginRequest, RegisterRequest},
    models::{
        AuthClient, Lifecycle, NewPrincipal, Permission, Principal, RequestContext, Role,
        RoleAssignment, SecurityEvent, SecurityEventType, SecuritySettings, Tenant,
    },
    services::{
        AuditConfig, AuthService, InMemoryDirectory, InMemoryStore, LinkMessage, ManualClock,
        MemoryAuditSink, MockLinkDispatcher, SharedStore,
    },
    utils::{hash_password, Password},
    AppState, Collaborators,
};
use secrecy::Secret;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const PASSWORD: &str = "Correct-Horse-9";
pub const NEW_PASSWORD: &str = "Battery-Staple-42";
pub const ALICE: &str = "alice@acme.test";
pub const READ_PERMISSION: &str = "documents:read";

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_version: "test".into(),
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".into(),
        },
        jwt: JwtConfig {
            issuer: "https://id.acme.test".into(),
            signing: JwtSigningKey::Hmac(Secret::new("integration-jwt-secret-0123456789ab".into())),
            access_token_minutes: 15,
            max_access_token_minutes: 60,
            refresh_token_days: 7,
            id_token_minutes: 15,
        },
        links: LinkConfig {
            signing_secret: Secret::new("integration-link-secret-0123456789ab".into()),
            base_url: "https://app.acme.test/".into(),
            reset_ttl: Duration::from_secs(30 * 60),
            invite_ttl: Duration::from_secs(3600),
            max_invite_ttl: Duration::from_secs(86_400),
        },
        rate_limit: RateLimitConfig::default(),
        timeouts: TimeoutConfig {
            dependency: Duration::from_millis(200),
        },
        smtp: None,
        audit: AuditConfig::default(),
        security: SecuritySettings::default(),
    }
}

pub struct TestApp {
    pub state: AppState,
    pub directory: Arc<InMemoryDirectory>,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub mailer: Arc<MockLinkDispatcher>,
    pub sink: Arc<MemoryAuditSink>,
    pub tenant: Tenant,
    pub client: AuthClient,
    pub other_tenant: Tenant,
    pub other_client: AuthClient,
    pub alice: Principal,
    pub member_role: Role,
    pub other_role: Role,
    pub read_permission: Permission,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with<F>(customize: F) -> Self
    where
        F: FnOnce(&mut IdentityConfig),
    {
        Self::spawn_with_store(customize, |store| store as Arc<dyn SharedStore>).await
    }

    /// Like `spawn_with`, but the services see the store through `wrap`.
    pub async fn spawn_with_store<F, W>(customize: F, wrap: W) -> Self
    where
        F: FnOnce(&mut IdentityConfig),
        W: FnOnce(Arc<InMemoryStore>) -> Arc<dyn SharedStore>,
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("identity_service=debug")
            .with_test_writer()
            .try_init();

        let mut config = test_config();
        customize(&mut config);

        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let directory = Arc::new(InMemoryDirectory::new());
        let mailer = MockLinkDispatcher::new();
        let sink = Arc::new(MemoryAuditSink::new());

        let mut tenant = Tenant::new("acme".into(), "Acme".into());
        tenant.lifecycle = Lifecycle::default_entity();
        let mut client = AuthClient::new("acme-web".into(), tenant.tenant_id, "Acme Web".into());
        client.issues_id_token = true;
        let other_tenant = Tenant::new("globex".into(), "Globex".into());
        let other_client =
            AuthClient::new("globex-web".into(), other_tenant.tenant_id, "Globex Web".into());

        directory.add_tenant(tenant.clone()).expect("seed tenant");
        directory.add_client(client.clone(), true).expect("seed client");
        directory.add_tenant(other_tenant.clone()).expect("seed tenant");
        directory
            .add_client(other_client.clone(), true)
            .expect("seed client");

        let mut member_role = Role::new(tenant.tenant_id, "member".into());
        member_role.lifecycle = Lifecycle::default_entity();
        let other_role = Role::new(other_tenant.tenant_id, "globex-admin".into());
        let read_permission = Permission::new(tenant.tenant_id, READ_PERMISSION, None);
        directory.add_role(member_role.clone()).expect("seed role");
        directory.add_role(other_role.clone()).expect("seed role");
        directory
            .add_permission(read_permission.clone())
            .expect("seed permission");
        directory
            .grant(member_role.role_id, read_permission.permission_id)
            .expect("seed grant");

        let alice = NewPrincipal {
            tenant_id: tenant.tenant_id,
            email: ALICE.into(),
            secret_hash: hash_password(&Password::new(PASSWORD))
                .expect("hash")
                .into_string(),
            email_verified: true,
            display_name: Some("Alice".into()),
        }
        .into_principal();
        directory.add_principal(alice.clone()).expect("seed principal");
        directory
            .assign(RoleAssignment {
                tenant_id: tenant.tenant_id,
                principal_id: alice.principal_id,
                role_id: member_role.role_id,
            })
            .expect("seed assignment");

        let collaborators = Collaborators {
            identity: directory.clone(),
            access: directory.clone(),
            store: wrap(store.clone()),
            dispatcher: mailer.clone(),
            clock: clock.clone(),
        };
        let (state, _writer) =
            build_state(config, collaborators, sink.clone()).expect("Failed to build state");

        Self {
            state,
            directory,
            store,
            clock,
            mailer,
            sink,
            tenant,
            client,
            other_tenant,
            other_client,
            alice,
            member_role,
            other_role,
            read_permission,
        }
    }

    /// Replaces the tenant's settings with an edited copy of the defaults.
    pub fn update_settings(&self, edit: impl FnOnce(&mut SecuritySettings)) {
        let mut settings = self.state.config.security.clone();
        edit(&mut settings);
        self.directory
            .set_security_settings(self.tenant.tenant_id, settings)
            .expect("settings");
    }

    /// Puts the address used by `ctx()` on the tenant's blocked list.
    pub fn block_client_address(&self) {
        self.update_settings(|s| s.ip.blocked = vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))]);
    }

    pub fn require_verified_email(&self) {
        self.update_settings(|s| s.general.require_verified_email = true);
    }

    pub fn auth(&self) -> &AuthService {
        &self.state.auth_service
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::new(
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))),
            Some("integration-test".into()),
        )
    }

    pub fn login_request(&self, email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            tenant_id: Some(self.tenant.tenant_id),
            client_id: Some(self.client.client_id.clone()),
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn register_request(&self, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            tenant_id: Some(self.tenant.tenant_id),
            client_id: Some(self.client.client_id.clone()),
            email: email.into(),
            password: password.into(),
            display_name: None,
        }
    }

    pub fn forgot_request(&self, email: &str) -> ForgotPasswordRequest {
        ForgotPasswordRequest {
            tenant_id: Some(self.tenant.tenant_id),
            client_id: Some(self.client.client_id.clone()),
            email: email.into(),
        }
    }

    pub fn invite_request(&self, email: &str, role_id: Option<Uuid>) -> IssueInviteRequest {
        IssueInviteRequest {
            email: email.into(),
            role_id,
            ttl_seconds: None,
        }
    }

    /// Waits for detached deliveries until at least `count` links went out.
    pub async fn wait_for_links(&self, count: usize) -> Vec<LinkMessage> {
        for _ in 0..200 {
            let sent = self.mailer.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.mailer.sent()
    }

    /// Token of the most recent dispatched link.
    pub async fn last_link_token(&self) -> String {
        let sent = self.wait_for_links(1).await;
        let message = sent.last().expect("no link dispatched");
        link_token(&message.link)
    }

    /// Drains the audit pipeline and returns everything recorded so far.
    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.state.audit.flush().await;
        self.sink.events()
    }

    pub async fn events_of(&self, event_type: SecurityEventType) -> Vec<SecurityEvent> {
        self.events()
            .await
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

pub fn link_token(link: &str) -> String {
    link.split_once("token=")
        .map(|(_, token)| token.to_string())
        .expect("link carries a token")
}
