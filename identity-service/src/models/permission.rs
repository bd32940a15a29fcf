//! Permission model - atomic grants, optionally scoped to an API resource.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::Status;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub permission_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: Status,
    /// Owning API; `None` for client-level or global permissions.
    pub api_id: Option<Uuid>,
}

impl Permission {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, api_id: Option<Uuid>) -> Self {
        Self {
            permission_id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            status: Status::Active,
            api_id,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }
}

/// API resource targeted by permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResource {
    pub api_id: Uuid,
    pub tenant_id: Uuid,
    /// Audience-style identifier, e.g. `https://billing.internal`.
    pub identifier: String,
    pub status: Status,
}

impl ApiResource {
    pub fn new(tenant_id: Uuid, identifier: impl Into<String>) -> Self {
        Self {
            api_id: Uuid::new_v4(),
            tenant_id,
            identifier: identifier.into(),
            status: Status::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }
}

/// A permission reached through an active role, with its owning API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantedPermission {
    pub permission: Permission,
    pub api: Option<ApiResource>,
}

impl GrantedPermission {
    /// `api:name` for API-scoped grants, the bare name otherwise.
    pub fn scope_token(&self) -> String {
        match &self.api {
            Some(api) => format!("{}:{}", api.identifier, self.permission.name),
            None => self.permission.name.clone(),
        }
    }

    pub fn matches(&self, name: &str, api_id: Option<Uuid>) -> bool {
        self.permission.name == name && self.permission.api_id == api_id
    }
}

/// Effective permissions of a principal, deduplicated by permission id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSet {
    grants: BTreeMap<Uuid, GrantedPermission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the permission was already present.
    pub fn insert(&mut self, grant: GrantedPermission) -> bool {
        self.grants
            .insert(grant.permission.permission_id, grant)
            .is_none()
    }

    pub fn contains(&self, name: &str, api_id: Option<Uuid>) -> bool {
        self.grants.values().any(|g| g.matches(name, api_id))
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GrantedPermission> {
        self.grants.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &Uuid> {
        self.grants.keys()
    }

    /// Space separated scope hint for access tokens, sorted for stability.
    pub fn scope_hint(&self) -> Option<String> {
        if self.grants.is_empty() {
            return None;
        }
        let mut tokens: Vec<String> = self.grants.values().map(|g| g.scope_token()).collect();
        tokens.sort();
        tokens.dedup();
        Some(tokens.join(" "))
    }
}
