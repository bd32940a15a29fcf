//! Persistence collaborators.
//!
//! The engine owns no schema. It reads tenants, clients, principals, roles and
//! grants through these traits and writes only principals, secrets and role
//! assignments. Every entity returned carries its own `tenant_id`; callers
//! check it rather than trusting the lookup key.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    ApiResource, AuthClient, NewPrincipal, Permission, Principal, PrincipalCreation, Role,
    RoleAssignment, SecuritySettings, Tenant,
};

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Option<Tenant>, anyhow::Error>;

    async fn default_tenant(&self) -> Result<Option<Tenant>, anyhow::Error>;

    async fn client_by_id(&self, client_id: &str) -> Result<Option<AuthClient>, anyhow::Error>;

    async fn default_client(&self, tenant_id: Uuid) -> Result<Option<AuthClient>, anyhow::Error>;

    async fn principal_by_identifier(
        &self,
        tenant_id: Uuid,
        identifier: &str,
    ) -> Result<Option<Principal>, anyhow::Error>;

    async fn principal_by_id(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Option<Principal>, anyhow::Error>;

    /// Idempotent on (tenant, identifier): a second call returns the
    /// existing principal untouched.
    async fn create_principal(
        &self,
        principal: NewPrincipal,
    ) -> Result<PrincipalCreation, anyhow::Error>;

    async fn update_secret(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        secret_hash: String,
    ) -> Result<(), anyhow::Error>;

    /// Tenant overrides; `None` means the configured defaults apply.
    async fn security_settings(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<SecuritySettings>, anyhow::Error>;
}

#[async_trait]
pub trait AccessDirectory: Send + Sync {
    async fn roles_for_principal(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Vec<Role>, anyhow::Error>;

    async fn role_by_id(&self, tenant_id: Uuid, role_id: Uuid)
        -> Result<Option<Role>, anyhow::Error>;

    async fn permissions_for_role(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, anyhow::Error>;

    async fn api_by_id(
        &self,
        tenant_id: Uuid,
        api_id: Uuid,
    ) -> Result<Option<ApiResource>, anyhow::Error>;

    async fn default_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>, anyhow::Error>;

    /// Idempotent; returns whether the assignment was new.
    async fn assign_role(&self, assignment: RoleAssignment) -> Result<bool, anyhow::Error>;
}

#[derive(Default)]
struct DirectoryState {
    tenants: HashMap<Uuid, Tenant>,
    default_tenant: Option<Uuid>,
    clients: HashMap<String, AuthClient>,
    default_clients: HashMap<Uuid, String>,
    principals: HashMap<Uuid, Principal>,
    identifiers: HashMap<(Uuid, String), Uuid>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    apis: HashMap<Uuid, ApiResource>,
    grants: HashMap<Uuid, BTreeSet<Uuid>>,
    assignments: HashSet<RoleAssignment>,
    settings: HashMap<Uuid, SecuritySettings>,
}

/// In-process directory backing tests and local runs.
///
/// Lookups do not filter by tenant beyond the lookup key, so a corrupt
/// cross-tenant reference is returned as stored.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, DirectoryState>, anyhow::Error> {
        self.state
            .read()
            .map_err(|e| anyhow::anyhow!("Directory lock poisoned: {}", e))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, DirectoryState>, anyhow::Error> {
        self.state
            .write()
            .map_err(|e| anyhow::anyhow!("Directory lock poisoned: {}", e))
    }

    async fn gate(&self) -> Result<(), anyhow::Error> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Directory unavailable"));
        }
        Ok(())
    }

    pub fn add_tenant(&self, tenant: Tenant) -> Result<(), anyhow::Error> {
        let mut state = self.write()?;
        if tenant.is_default() {
            state.default_tenant = Some(tenant.tenant_id);
        }
        state.tenants.insert(tenant.tenant_id, tenant);
        Ok(())
    }

    pub fn add_client(&self, client: AuthClient, is_default: bool) -> Result<(), anyhow::Error> {
        let mut state = self.write()?;
        if is_default {
            state
                .default_clients
                .insert(client.tenant_id, client.client_id.clone());
        }
        state.clients.insert(client.client_id.clone(), client);
        Ok(())
    }

    pub fn add_principal(&self, principal: Principal) -> Result<(), anyhow::Error> {
        let mut state = self.write()?;
        state.identifiers.insert(
            (principal.tenant_id, principal.email.to_lowercase()),
            principal.principal_id,
        );
        state.principals.insert(principal.principal_id, principal);
        Ok(())
    }

    pub fn update_principal<F>(&self, principal_id: Uuid, f: F) -> Result<(), anyhow::Error>
    where
        F: FnOnce(&mut Principal),
    {
        let mut state = self.write()?;
        let principal = state
            .principals
            .get_mut(&principal_id)
            .ok_or_else(|| anyhow::anyhow!("Principal not found"))?;
        f(principal);
        principal.updated_utc = Utc::now();
        Ok(())
    }

    pub fn add_role(&self, role: Role) -> Result<(), anyhow::Error> {
        self.write()?.roles.insert(role.role_id, role);
        Ok(())
    }

    pub fn update_role<F>(&self, role_id: Uuid, f: F) -> Result<(), anyhow::Error>
    where
        F: FnOnce(&mut Role),
    {
        let mut state = self.write()?;
        let role = state
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| anyhow::anyhow!("Role not found"))?;
        f(role);
        Ok(())
    }

    pub fn add_permission(&self, permission: Permission) -> Result<(), anyhow::Error> {
        self.write()?
            .permissions
            .insert(permission.permission_id, permission);
        Ok(())
    }

    pub fn add_api(&self, api: ApiResource) -> Result<(), anyhow::Error> {
        self.write()?.apis.insert(api.api_id, api);
        Ok(())
    }

    pub fn grant(&self, role_id: Uuid, permission_id: Uuid) -> Result<(), anyhow::Error> {
        self.write()?
            .grants
            .entry(role_id)
            .or_default()
            .insert(permission_id);
        Ok(())
    }

    pub fn assign(&self, assignment: RoleAssignment) -> Result<bool, anyhow::Error> {
        Ok(self.write()?.assignments.insert(assignment))
    }

    pub fn revoke_role(&self, assignment: &RoleAssignment) -> Result<bool, anyhow::Error> {
        Ok(self.write()?.assignments.remove(assignment))
    }

    pub fn set_security_settings(
        &self,
        tenant_id: Uuid,
        settings: SecuritySettings,
    ) -> Result<(), anyhow::Error> {
        self.write()?.settings.insert(tenant_id, settings);
        Ok(())
    }

    /// Test inspection of stored principals, bypassing the gate.
    pub fn stored_principal(&self, principal_id: Uuid) -> Option<Principal> {
        self.read()
            .ok()
            .and_then(|s| s.principals.get(&principal_id).cloned())
    }

    pub fn principal_count(&self, tenant_id: Uuid) -> usize {
        self.read()
            .map(|s| s.principals.values().filter(|p| p.tenant_id == tenant_id).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryDirectory {
    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Option<Tenant>, anyhow::Error> {
        self.gate().await?;
        Ok(self.read()?.tenants.get(&tenant_id).cloned())
    }

    async fn default_tenant(&self) -> Result<Option<Tenant>, anyhow::Error> {
        self.gate().await?;
        let state = self.read()?;
        Ok(state
            .default_tenant
            .and_then(|id| state.tenants.get(&id).cloned()))
    }

    async fn client_by_id(&self, client_id: &str) -> Result<Option<AuthClient>, anyhow::Error> {
        self.gate().await?;
        Ok(self.read()?.clients.get(client_id).cloned())
    }

    async fn default_client(&self, tenant_id: Uuid) -> Result<Option<AuthClient>, anyhow::Error> {
        self.gate().await?;
        let state = self.read()?;
        Ok(state
            .default_clients
            .get(&tenant_id)
            .and_then(|id| state.clients.get(id).cloned()))
    }

    async fn principal_by_identifier(
        &self,
        tenant_id: Uuid,
        identifier: &str,
    ) -> Result<Option<Principal>, anyhow::Error> {
        self.gate().await?;
        let state = self.read()?;
        let key = (tenant_id, identifier.trim().to_lowercase());
        Ok(state
            .identifiers
            .get(&key)
            .and_then(|id| state.principals.get(id).cloned()))
    }

    async fn principal_by_id(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Option<Principal>, anyhow::Error> {
        self.gate().await?;
        Ok(self
            .read()?
            .principals
            .get(&principal_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn create_principal(
        &self,
        principal: NewPrincipal,
    ) -> Result<PrincipalCreation, anyhow::Error> {
        self.gate().await?;
        let principal = principal.into_principal();
        let key = (principal.tenant_id, principal.email.clone());

        let mut state = self.write()?;
        if let Some(existing) = state
            .identifiers
            .get(&key)
            .and_then(|id| state.principals.get(id))
        {
            return Ok(PrincipalCreation::Existing(existing.clone()));
        }
        state.identifiers.insert(key, principal.principal_id);
        state
            .principals
            .insert(principal.principal_id, principal.clone());
        Ok(PrincipalCreation::Created(principal))
    }

    async fn update_secret(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        secret_hash: String,
    ) -> Result<(), anyhow::Error> {
        self.gate().await?;
        let mut state = self.write()?;
        let principal = state
            .principals
            .get_mut(&principal_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| anyhow::anyhow!("Principal not found"))?;
        principal.secret_hash = secret_hash;
        principal.updated_utc = Utc::now();
        Ok(())
    }

    async fn security_settings(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<SecuritySettings>, anyhow::Error> {
        self.gate().await?;
        Ok(self.read()?.settings.get(&tenant_id).cloned())
    }
}

#[async_trait]
impl AccessDirectory for InMemoryDirectory {
    async fn roles_for_principal(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Vec<Role>, anyhow::Error> {
        self.gate().await?;
        let state = self.read()?;
        let mut roles: Vec<Role> = state
            .assignments
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.principal_id == principal_id)
            .filter_map(|a| state.roles.get(&a.role_id).cloned())
            .collect();
        roles.sort_by_key(|r| r.role_id);
        Ok(roles)
    }

    async fn role_by_id(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Option<Role>, anyhow::Error> {
        self.gate().await?;
        Ok(self
            .read()?
            .roles
            .get(&role_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn permissions_for_role(
        &self,
        _tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, anyhow::Error> {
        self.gate().await?;
        let state = self.read()?;
        Ok(state
            .grants
            .get(&role_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.permissions.get(id).cloned())
            .collect())
    }

    async fn api_by_id(
        &self,
        _tenant_id: Uuid,
        api_id: Uuid,
    ) -> Result<Option<ApiResource>, anyhow::Error> {
        self.gate().await?;
        Ok(self.read()?.apis.get(&api_id).cloned())
    }

    async fn default_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>, anyhow::Error> {
        self.gate().await?;
        let state = self.read()?;
        let mut roles: Vec<Role> = state
            .roles
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.is_default() && r.is_active())
            .cloned()
            .collect();
        roles.sort_by_key(|r| r.role_id);
        Ok(roles)
    }

    async fn assign_role(&self, assignment: RoleAssignment) -> Result<bool, anyhow::Error> {
        self.gate().await?;
        Ok(self.write()?.assignments.insert(assignment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Lifecycle;

    fn new_principal(tenant_id: Uuid, email: &str) -> NewPrincipal {
        NewPrincipal {
            tenant_id,
            email: email.to_string(),
            secret_hash: "hash".into(),
            email_verified: false,
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_principal_is_idempotent() {
        let dir = InMemoryDirectory::new();
        let tenant = Uuid::new_v4();
        let first = dir
            .create_principal(new_principal(tenant, "Bob@Example.com"))
            .await
            .unwrap();
        let second = dir
            .create_principal(new_principal(tenant, "bob@example.com"))
            .await
            .unwrap();
        assert!(matches!(first, PrincipalCreation::Created(_)));
        assert!(matches!(second, PrincipalCreation::Existing(_)));
        assert_eq!(
            first.principal().principal_id,
            second.principal().principal_id
        );
        assert_eq!(dir.principal_count(tenant), 1);

        // Same identifier in another tenant is a different principal.
        let other = dir
            .create_principal(new_principal(Uuid::new_v4(), "bob@example.com"))
            .await
            .unwrap();
        assert!(matches!(other, PrincipalCreation::Created(_)));
    }

    #[tokio::test]
    async fn test_default_roles_only_active_defaults() {
        let dir = InMemoryDirectory::new();
        let tenant = Uuid::new_v4();
        let mut member = Role::new(tenant, "member".into());
        member.lifecycle = Lifecycle::default_entity();
        dir.add_role(member.clone()).unwrap();
        dir.add_role(Role::new(tenant, "admin".into())).unwrap();

        let defaults = dir.default_roles(tenant).await.unwrap();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].role_id, member.role_id);
    }

    #[tokio::test]
    async fn test_unavailable_directory_errors() {
        let dir = InMemoryDirectory::new();
        dir.set_unavailable(true);
        assert!(dir.default_tenant().await.is_err());
        dir.set_unavailable(false);
        assert!(dir.default_tenant().await.unwrap().is_none());
    }
}
