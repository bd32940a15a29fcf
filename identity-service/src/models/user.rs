//! Principal model - tenant-scoped user accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Status;

/// Principal entity (tenant-scoped).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub principal_id: Uuid,
    pub tenant_id: Uuid,
    /// Login identifier, an email address.
    pub email: String,
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub profile_completed: bool,
    pub account_completed: bool,
    pub display_name: Option<String>,
    pub status: Status,
    /// Soft-delete marker; principals are never hard-deleted.
    pub deleted_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Principal {
    /// Check if principal may authenticate.
    pub fn is_active(&self) -> bool {
        self.status == Status::Active && self.deleted_utc.is_none()
    }

    pub fn identifier_matches(&self, identifier: &str) -> bool {
        self.email.eq_ignore_ascii_case(identifier.trim())
    }
}

/// Input for principal creation.
#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub tenant_id: Uuid,
    pub email: String,
    pub secret_hash: String,
    pub email_verified: bool,
    pub display_name: Option<String>,
}

impl NewPrincipal {
    pub fn into_principal(self) -> Principal {
        let now = Utc::now();
        Principal {
            principal_id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            email: self.email.trim().to_lowercase(),
            phone: None,
            secret_hash: self.secret_hash,
            email_verified: self.email_verified,
            phone_verified: false,
            profile_completed: false,
            account_completed: self.email_verified,
            display_name: self.display_name,
            status: Status::Active,
            deleted_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Outcome of idempotent principal creation keyed by (tenant, identifier).
#[derive(Debug, Clone)]
pub enum PrincipalCreation {
    Created(Principal),
    Existing(Principal),
}

impl PrincipalCreation {
    pub fn principal(&self) -> &Principal {
        match self {
            PrincipalCreation::Created(p) | PrincipalCreation::Existing(p) => p,
        }
    }
}
