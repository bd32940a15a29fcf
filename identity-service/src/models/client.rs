//! Auth client model - applications permitted to authenticate principals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Lifecycle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClient {
    pub client_id: String,
    pub tenant_id: Uuid,
    pub app_name: String,
    /// Present for confidential clients only.
    pub client_secret_hash: Option<String>,
    pub redirect_uris: Vec<String>,
    /// Owning identity provider for federated login.
    pub identity_provider: Option<String>,
    /// Whether token triads for this client carry an ID token.
    pub issues_id_token: bool,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
}

impl AuthClient {
    pub fn new(client_id: String, tenant_id: Uuid, app_name: String) -> Self {
        Self {
            client_id,
            tenant_id,
            app_name,
            client_secret_hash: None,
            redirect_uris: Vec::new(),
            identity_provider: None,
            issues_id_token: false,
            lifecycle: Lifecycle::active(),
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    pub fn is_confidential(&self) -> bool {
        self.client_secret_hash.is_some()
    }

    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|allowed| allowed == uri)
    }
}
