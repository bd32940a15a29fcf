use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

use super::clock::Clock;
use super::error::ServiceError;
use super::tenant_resolver::ResolvedScope;
use crate::config::{JwtConfig, JwtSigningKey};
use crate::models::{PermissionSet, Principal, SessionSettings};

const ACCESS_USE: &str = "access";
const REFRESH_USE: &str = "refresh";

/// Token issuer: mints and checks the access/refresh/ID token triad.
#[derive(Clone)]
pub struct TokenIssuer {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_token_minutes: i64,
    max_access_token_minutes: i64,
    refresh_token_days: i64,
    id_token_minutes: i64,
    clock: Arc<dyn Clock>,
}

/// Expiry is checked against the issuer's clock, not the decoder's.
trait Expiring {
    fn exp(&self) -> i64;
}

/// Claims for access tokens (short-lived).
///
/// Identity and scope only. Permissions are a hint for clients and are
/// re-resolved on every authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    /// Principal id
    pub sub: String,
    /// Tenant id
    pub tid: Uuid,
    /// Client id
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub token_use: String,
}

/// Claims for refresh tokens (long-lived, revocable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    pub iss: String,
    pub sub: String,
    pub tid: Uuid,
    pub cid: String,
    /// Token id, the revocation key.
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
    /// Issue time in milliseconds, compared against revocation cutoffs.
    pub iat_ms: i64,
    pub token_use: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub tid: Uuid,
    pub email: String,
    pub email_verified: bool,
    pub exp: i64,
    pub iat: i64,
}

impl Expiring for AccessTokenClaims {
    fn exp(&self) -> i64 {
        self.exp
    }
}

impl Expiring for RefreshTokenClaims {
    fn exp(&self) -> i64 {
        self.exp
    }
}

impl Expiring for IdTokenClaims {
    fn exp(&self) -> i64 {
        self.exp
    }
}

/// Token set returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct TokenTriad {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub token_type: String,
    /// Seconds
    pub expires_in: i64,
    /// Seconds
    pub refresh_expires_in: i64,
    pub issued_at: DateTime<Utc>,
    #[serde(skip)]
    pub refresh_token_id: String,
}

impl TokenIssuer {
    pub fn new(config: &JwtConfig, clock: Arc<dyn Clock>) -> Result<Self, anyhow::Error> {
        let (algorithm, encoding_key, decoding_key) = match &config.signing {
            JwtSigningKey::Rsa {
                private_key_path,
                public_key_path,
            } => {
                let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read private key from {}: {}", private_key_path, e)
                })?;
                let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
                })?;
                let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
                let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;
                tracing::info!("Token issuer initialized with RS256 keys");
                (Algorithm::RS256, encoding_key, decoding_key)
            }
            JwtSigningKey::Hmac(secret) => {
                let secret = secret.expose_secret().as_bytes();
                tracing::info!("Token issuer initialized with HS256 secret");
                (
                    Algorithm::HS256,
                    EncodingKey::from_secret(secret),
                    DecodingKey::from_secret(secret),
                )
            }
        };

        Ok(Self {
            algorithm,
            encoding_key,
            decoding_key,
            issuer: config.issuer.clone(),
            access_token_minutes: config.access_token_minutes,
            max_access_token_minutes: config.max_access_token_minutes,
            refresh_token_days: config.refresh_token_days,
            id_token_minutes: config.id_token_minutes,
            clock,
        })
    }

    /// Access lifetime for a tenant, never above the configured maximum.
    pub fn access_ttl_minutes(&self, session: &SessionSettings) -> i64 {
        session
            .access_token_minutes
            .unwrap_or(self.access_token_minutes)
            .min(self.max_access_token_minutes)
            .max(1)
    }

    pub fn refresh_ttl_days(&self, session: &SessionSettings) -> i64 {
        session
            .refresh_token_days
            .unwrap_or(self.refresh_token_days)
            .max(1)
    }

    /// Longest a refresh token issued now can live, in seconds.
    pub fn max_refresh_ttl_secs(&self, session: &SessionSettings) -> i64 {
        self.refresh_ttl_days(session) * 86_400
    }

    pub fn issue(
        &self,
        principal: &Principal,
        scope: &ResolvedScope,
        permissions: Option<&PermissionSet>,
        session: &SessionSettings,
    ) -> Result<TokenTriad, ServiceError> {
        if principal.tenant_id != scope.tenant_id() {
            return Err(ServiceError::TenantBoundaryViolation(format!(
                "principal {} is not in tenant {}",
                principal.principal_id,
                scope.tenant_id()
            )));
        }

        let now = self.clock.now();
        let access_minutes = self.access_ttl_minutes(session);
        let refresh_days = self.refresh_ttl_days(session);
        let subject = principal.principal_id.to_string();

        let access = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: subject.clone(),
            tid: scope.tenant_id(),
            cid: scope.client_id().to_string(),
            scope: permissions.and_then(PermissionSet::scope_hint),
            exp: (now + Duration::minutes(access_minutes)).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_use: ACCESS_USE.to_string(),
        };

        let refresh_token_id = Uuid::new_v4().to_string();
        let refresh = RefreshTokenClaims {
            iss: self.issuer.clone(),
            sub: subject.clone(),
            tid: scope.tenant_id(),
            cid: scope.client_id().to_string(),
            jti: refresh_token_id.clone(),
            exp: (now + Duration::days(refresh_days)).timestamp(),
            iat: now.timestamp(),
            iat_ms: now.timestamp_millis(),
            token_use: REFRESH_USE.to_string(),
        };

        let id_token = if scope.client().issues_id_token {
            let id = IdTokenClaims {
                iss: self.issuer.clone(),
                sub: subject,
                aud: scope.client_id().to_string(),
                tid: scope.tenant_id(),
                email: principal.email.clone(),
                email_verified: principal.email_verified,
                exp: (now + Duration::minutes(self.id_token_minutes)).timestamp(),
                iat: now.timestamp(),
            };
            Some(self.sign(&id, "ID")?)
        } else {
            None
        };

        Ok(TokenTriad {
            access_token: self.sign(&access, "access")?,
            refresh_token: self.sign(&refresh, "refresh")?,
            id_token,
            token_type: "Bearer".to_string(),
            expires_in: access_minutes * 60,
            refresh_expires_in: refresh_days * 86_400,
            issued_at: now,
            refresh_token_id,
        })
    }

    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        let claims: AccessTokenClaims = self.verify(token, None)?;
        if claims.token_use != ACCESS_USE {
            return Err(ServiceError::InvalidCredentials);
        }
        Ok(claims)
    }

    pub fn validate_refresh_token(&self, token: &str) -> Result<RefreshTokenClaims, ServiceError> {
        let claims: RefreshTokenClaims = self.verify(token, None)?;
        if claims.token_use != REFRESH_USE {
            return Err(ServiceError::InvalidCredentials);
        }
        Ok(claims)
    }

    pub fn validate_id_token(&self, token: &str, client_id: &str) -> Result<IdTokenClaims, ServiceError> {
        self.verify(token, Some(client_id))
    }

    fn sign<T: Serialize>(&self, claims: &T, kind: &str) -> Result<String, ServiceError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode {} token: {}", kind, e)))
    }

    fn verify<T: serde::de::DeserializeOwned + Expiring>(
        &self,
        token: &str,
        audience: Option<&str>,
    ) -> Result<T, ServiceError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        if let Some(aud) = audience {
            validation.set_audience(&[aud]);
        }

        let claims = decode::<T>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                ServiceError::InvalidCredentials
            })?;
        if self.clock.now().timestamp() >= claims.exp() {
            tracing::debug!("Token expired");
            return Err(ServiceError::InvalidCredentials);
        }
        Ok(claims)
    }
}
