//! Lifecycle model shared by tenants, clients and roles.
//!
//! Status changes go through [`Lifecycle::transition`]: active and inactive
//! toggle freely, either may be suspended, a suspended entity can only be
//! reactivated. System and default entities never transition.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Inactive,
    Suspended,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
            Status::Suspended => "suspended",
        }
    }
}

/// Whether an entity may be modified by administrative operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Immutability {
    Mutable,
    /// Provisioned by the platform; immutable and non-deletable.
    System,
    /// The fallback entity of its kind within a tenant; immutable.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("{0:?} entities cannot change status")]
    Immutable(Immutability),

    #[error("transition from {from} to {to} is not allowed")]
    InvalidTransition { from: &'static str, to: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: Status,
    pub immutability: Immutability,
}

impl Lifecycle {
    pub fn active() -> Self {
        Self {
            status: Status::Active,
            immutability: Immutability::Mutable,
        }
    }

    pub fn system() -> Self {
        Self {
            status: Status::Active,
            immutability: Immutability::System,
        }
    }

    pub fn default_entity() -> Self {
        Self {
            status: Status::Active,
            immutability: Immutability::Default,
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            immutability: Immutability::Mutable,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    pub fn is_system(&self) -> bool {
        self.immutability == Immutability::System
    }

    pub fn is_default(&self) -> bool {
        self.immutability == Immutability::Default
    }

    /// System and default entities cannot be deleted.
    pub fn is_deletable(&self) -> bool {
        self.immutability == Immutability::Mutable
    }

    /// Apply a status change. Transitioning to the current status is a no-op.
    pub fn transition(&mut self, to: Status) -> Result<(), LifecycleError> {
        if self.immutability != Immutability::Mutable {
            return Err(LifecycleError::Immutable(self.immutability));
        }

        let allowed = matches!(
            (self.status, to),
            (Status::Active, Status::Inactive)
                | (Status::Inactive, Status::Active)
                | (Status::Active, Status::Suspended)
                | (Status::Inactive, Status::Suspended)
                | (Status::Suspended, Status::Active)
        );

        if self.status == to {
            return Ok(());
        }

        if !allowed {
            return Err(LifecycleError::InvalidTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }

        self.status = to;
        Ok(())
    }
}
