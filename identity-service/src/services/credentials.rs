//! Credential verification.
//!
//! The verifier keeps "unknown principal" and "wrong secret" apart so the
//! audit trail can tell them apart; callers collapse both into one response.
//! Unknown identifiers still pay for a full hash comparison.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::directory::IdentityDirectory;
use super::error::{with_deadline, ServiceError};
use super::tenant_resolver::ResolvedScope;
use crate::models::Principal;
use crate::utils::{hash_password, verify_password, Password, PasswordHashString};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unknown principal")]
    UnknownPrincipal,
    #[error("wrong secret")]
    WrongSecret,
    /// Correct secret, but the principal may not authenticate.
    #[error("principal is {0}")]
    NotActive(&'static str),
    #[error("credential check unavailable: {0}")]
    Unavailable(String),
}

impl From<CredentialError> for ServiceError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Unavailable(reason) => ServiceError::ServiceUnavailable(reason),
            _ => ServiceError::InvalidCredentials,
        }
    }
}

#[derive(Clone)]
pub struct CredentialVerifier {
    directory: Arc<dyn IdentityDirectory>,
    timeout: Duration,
    dummy_hash: Arc<PasswordHashString>,
}

impl CredentialVerifier {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let dummy_hash = hash_password(&Password::new(uuid::Uuid::new_v4().to_string()))?;
        Ok(Self {
            directory,
            timeout,
            dummy_hash: Arc::new(dummy_hash),
        })
    }

    pub async fn verify(
        &self,
        scope: &ResolvedScope,
        identifier: &str,
        secret: &Password,
    ) -> Result<Principal, CredentialError> {
        let principal = with_deadline(
            self.timeout,
            "directory",
            self.directory
                .principal_by_identifier(scope.tenant_id(), identifier),
        )
        .await
        .map_err(unavailable)?;

        let stored = match &principal {
            Some(p) => PasswordHashString::new(p.secret_hash.clone()),
            None => (*self.dummy_hash).clone(),
        };
        let matches = check_secret(secret.clone(), stored).await?;

        let principal = principal.ok_or(CredentialError::UnknownPrincipal)?;
        if !matches {
            return Err(CredentialError::WrongSecret);
        }
        if principal.tenant_id != scope.tenant_id() {
            // Lookup was keyed by tenant; anything else is a directory bug.
            return Err(CredentialError::UnknownPrincipal);
        }
        if principal.deleted_utc.is_some() {
            return Err(CredentialError::NotActive("deleted"));
        }
        if !principal.is_active() {
            return Err(CredentialError::NotActive(principal.status.as_str()));
        }
        Ok(principal)
    }

    /// Hashes a new secret off the async workers.
    pub async fn hash_secret(&self, secret: &Password) -> Result<PasswordHashString, ServiceError> {
        let secret = secret.clone();
        tokio::task::spawn_blocking(move || hash_password(&secret))
            .await
            .map_err(|e| anyhow::anyhow!("Hashing task failed: {}", e))?
            .map_err(ServiceError::Internal)
    }

    /// Compares without a principal lookup, for idempotent resubmits.
    pub async fn matches(&self, principal: &Principal, secret: &Password) -> Result<bool, ServiceError> {
        check_secret(secret.clone(), PasswordHashString::new(principal.secret_hash.clone()))
            .await
            .map_err(ServiceError::from)
    }
}

fn unavailable(err: ServiceError) -> CredentialError {
    match err {
        ServiceError::ServiceUnavailable(reason) => CredentialError::Unavailable(reason),
        other => CredentialError::Unavailable(other.to_string()),
    }
}

async fn check_secret(secret: Password, stored: PasswordHashString) -> Result<bool, CredentialError> {
    let outcome = tokio::task::spawn_blocking(move || verify_password(&secret, &stored))
        .await
        .map_err(|e| CredentialError::Unavailable(format!("verification task failed: {e}")))?;
    match outcome {
        Ok(matches) => Ok(matches),
        Err(e) => {
            // An unreadable stored hash can never match.
            tracing::error!(error = %e, "Stored secret hash is unusable");
            Ok(false)
        }
    }
}
