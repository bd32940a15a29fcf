//! Tenant/client resolution: the chokepoint every flow passes through.
//!
//! Downstream components accept a `ResolvedScope`, which can only be built
//! here, so raw tenant and client identifiers never travel further.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::directory::IdentityDirectory;
use super::error::{with_deadline, ServiceError};
use super::security_audit::SecurityAuditService;
use crate::models::{
    AuthClient, LinkClaims, RequestContext, SecurityEvent, SecurityEventType, Severity, Tenant,
};

/// Identifiers as supplied by the caller or a signed link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeRequest {
    pub tenant_id: Option<Uuid>,
    pub client_id: Option<String>,
}

impl ScopeRequest {
    pub fn new(tenant_id: Option<Uuid>, client_id: Option<String>) -> Self {
        Self {
            tenant_id,
            client_id,
        }
    }
}

/// A consistent, active (tenant, client) pair.
#[derive(Debug, Clone)]
pub struct ResolvedScope {
    tenant: Tenant,
    client: AuthClient,
}

impl ResolvedScope {
    pub(crate) fn new(tenant: Tenant, client: AuthClient) -> Self {
        Self { tenant, client }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant.tenant_id
    }

    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }
}

#[derive(Clone)]
pub struct TenantResolver {
    directory: Arc<dyn IdentityDirectory>,
    audit: SecurityAuditService,
    timeout: Duration,
}

impl TenantResolver {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        audit: SecurityAuditService,
        timeout: Duration,
    ) -> Self {
        Self {
            directory,
            audit,
            timeout,
        }
    }

    /// Resolves the pair or fails with `TenantNotFound`, recording a MEDIUM
    /// event on that failure. Without a tenant id the client's tenant is
    /// used, and without either the default tenant. Without a client id the
    /// tenant's default client is used.
    pub async fn resolve(
        &self,
        request: &ScopeRequest,
        ctx: &RequestContext,
    ) -> Result<ResolvedScope, ServiceError> {
        match self.lookup(request).await? {
            Ok(scope) => Ok(scope),
            Err(reason) => {
                tracing::info!(
                    tenant_id = ?request.tenant_id,
                    client_id = ?request.client_id,
                    reason,
                    "Scope resolution failed"
                );
                self.audit.record(
                    SecurityEvent::new(
                        SecurityEventType::ScopeResolutionFailed,
                        Severity::Medium,
                        ctx,
                    )
                    .tenant(request.tenant_id, request.client_id.clone())
                    .detail(reason),
                );
                Err(ServiceError::TenantNotFound)
            }
        }
    }

    /// Resolves the scope a signed link was issued for.
    pub async fn resolve_link(
        &self,
        claims: &LinkClaims,
        ctx: &RequestContext,
    ) -> Result<ResolvedScope, ServiceError> {
        let request = ScopeRequest::new(Some(claims.tenant_id), claims.client_id.clone());
        self.resolve(&request, ctx).await
    }

    /// Outer error: dependency failure. Inner error: why the pair is not usable.
    async fn lookup(
        &self,
        request: &ScopeRequest,
    ) -> Result<Result<ResolvedScope, &'static str>, ServiceError> {
        let requested_client = match &request.client_id {
            Some(id) => {
                let client = with_deadline(self.timeout, "directory", self.directory.client_by_id(id))
                    .await?;
                match client {
                    Some(client) => Some(client),
                    None => return Ok(Err("client not found")),
                }
            }
            None => None,
        };

        let tenant = match (request.tenant_id, &requested_client) {
            (Some(tenant_id), _) => {
                with_deadline(self.timeout, "directory", self.directory.tenant_by_id(tenant_id))
                    .await?
            }
            (None, Some(client)) => {
                with_deadline(
                    self.timeout,
                    "directory",
                    self.directory.tenant_by_id(client.tenant_id),
                )
                .await?
            }
            (None, None) => {
                with_deadline(self.timeout, "directory", self.directory.default_tenant()).await?
            }
        };
        let Some(tenant) = tenant else {
            return Ok(Err("tenant not found"));
        };
        if !tenant.is_active() {
            return Ok(Err("tenant inactive"));
        }

        let client = match requested_client {
            Some(client) => client,
            None => {
                let client = with_deadline(
                    self.timeout,
                    "directory",
                    self.directory.default_client(tenant.tenant_id),
                )
                .await?;
                match client {
                    Some(client) => client,
                    None => return Ok(Err("tenant has no default client")),
                }
            }
        };
        if client.tenant_id != tenant.tenant_id {
            return Ok(Err("client does not belong to tenant"));
        }
        if !client.is_active() {
            return Ok(Err("client inactive"));
        }

        Ok(Ok(ResolvedScope::new(tenant, client)))
    }
}
