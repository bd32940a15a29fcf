//! Effective permission resolution across roles, grants and APIs.
//!
//! Full resolution and the single-permission check share one traversal, so
//! the two can never disagree about what a principal holds.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::directory::AccessDirectory;
use super::error::{with_deadline, ServiceError};
use super::tenant_resolver::ResolvedScope;
use crate::models::{ApiResource, GrantedPermission, PermissionSet, Principal};

#[derive(Clone)]
pub struct PermissionResolver {
    directory: Arc<dyn AccessDirectory>,
    timeout: Duration,
}

impl PermissionResolver {
    pub fn new(directory: Arc<dyn AccessDirectory>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    /// Union of active permissions reachable through active roles whose API,
    /// if any, is active. Zero roles yields an empty set.
    pub async fn resolve(
        &self,
        scope: &ResolvedScope,
        principal: &Principal,
    ) -> Result<PermissionSet, ServiceError> {
        let mut set = PermissionSet::new();
        self.walk(scope, principal, |grant| {
            set.insert(grant);
            ControlFlow::Continue(())
        })
        .await?;
        Ok(set)
    }

    /// Whether the principal holds `name` scoped to `api_id` (`None` for
    /// client-level permissions). Stops at the first match.
    pub async fn has_permission(
        &self,
        scope: &ResolvedScope,
        principal: &Principal,
        name: &str,
        api_id: Option<Uuid>,
    ) -> Result<bool, ServiceError> {
        let mut found = false;
        self.walk(scope, principal, |grant| {
            if grant.matches(name, api_id) {
                found = true;
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;
        Ok(found)
    }

    async fn walk<F>(
        &self,
        scope: &ResolvedScope,
        principal: &Principal,
        mut visit: F,
    ) -> Result<(), ServiceError>
    where
        F: FnMut(GrantedPermission) -> ControlFlow<()> + Send,
    {
        let tenant_id = scope.tenant_id();
        ensure_tenant(tenant_id, principal.tenant_id, "principal", principal.principal_id)?;

        let roles = with_deadline(
            self.timeout,
            "access_directory",
            self.directory
                .roles_for_principal(tenant_id, principal.principal_id),
        )
        .await?;

        let mut apis: HashMap<Uuid, Option<ApiResource>> = HashMap::new();
        for role in roles {
            ensure_tenant(tenant_id, role.tenant_id, "role", role.role_id)?;
            if !role.is_active() {
                continue;
            }

            let permissions = with_deadline(
                self.timeout,
                "access_directory",
                self.directory.permissions_for_role(tenant_id, role.role_id),
            )
            .await?;

            for permission in permissions {
                ensure_tenant(
                    tenant_id,
                    permission.tenant_id,
                    "permission",
                    permission.permission_id,
                )?;
                if !permission.is_active() {
                    continue;
                }

                let api = match permission.api_id {
                    None => None,
                    Some(api_id) => {
                        let api = match apis.get(&api_id) {
                            Some(cached) => cached.clone(),
                            None => {
                                let fetched = with_deadline(
                                    self.timeout,
                                    "access_directory",
                                    self.directory.api_by_id(tenant_id, api_id),
                                )
                                .await?;
                                apis.insert(api_id, fetched.clone());
                                fetched
                            }
                        };
                        // A dangling API reference grants nothing.
                        let Some(api) = api else { continue };
                        ensure_tenant(tenant_id, api.tenant_id, "api", api.api_id)?;
                        if !api.is_active() {
                            continue;
                        }
                        Some(api)
                    }
                };

                if visit(GrantedPermission { permission, api }).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn ensure_tenant(
    expected: Uuid,
    actual: Uuid,
    entity: &'static str,
    id: Uuid,
) -> Result<(), ServiceError> {
    if expected == actual {
        return Ok(());
    }
    tracing::error!(
        entity,
        entity_id = %id,
        expected_tenant = %expected,
        actual_tenant = %actual,
        "Cross-tenant reference during permission resolution"
    );
    Err(ServiceError::TenantBoundaryViolation(format!(
        "{entity} {id} belongs to another tenant"
    )))
}
