//! Role model - tenant-scoped permission bundles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Lifecycle;

/// Role entity (tenant-scoped).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: Uuid,
    pub tenant_id: Uuid,
    pub role_label: String,
    pub lifecycle: Lifecycle,
    pub created_utc: DateTime<Utc>,
}

impl Role {
    /// Create a new role.
    pub fn new(tenant_id: Uuid, role_label: String) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            tenant_id,
            role_label,
            lifecycle: Lifecycle::active(),
            created_utc: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Default roles are granted to every new principal of the tenant.
    pub fn is_default(&self) -> bool {
        self.lifecycle.is_default()
    }
}

/// Principal to role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleAssignment {
    pub tenant_id: Uuid,
    pub principal_id: Uuid,
    pub role_id: Uuid,
}
