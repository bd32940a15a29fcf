//! Tenant model - root of multi-tenancy hierarchy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Lifecycle;

/// Tenant entity (also known as an auth container).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub tenant_slug: String,
    pub tenant_label: String,
    /// Public tenants accept self-registration.
    pub is_public: bool,
    pub lifecycle: Lifecycle,
    pub created_utc: DateTime<Utc>,
}

impl Tenant {
    /// Create a new tenant.
    pub fn new(tenant_slug: String, tenant_label: String) -> Self {
        Self {
            tenant_id: Uuid::new_v4(),
            tenant_slug,
            tenant_label,
            is_public: false,
            lifecycle: Lifecycle::active(),
            created_utc: Utc::now(),
        }
    }

    /// Check if tenant is active.
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    pub fn is_default(&self) -> bool {
        self.lifecycle.is_default()
    }

    pub fn is_system(&self) -> bool {
        self.lifecycle.is_system()
    }
}
