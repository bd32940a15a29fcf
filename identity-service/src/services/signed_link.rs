//! Tamper-evident, expiring, single-use links.
//!
//! Token layout: `b64url(claims_json) "." b64url(hmac_sha256("link.v1." || claims_json))`.
//! The claim set is never stored; only consumed nonces are, until shortly
//! after the link would have expired anyway.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use secrecy::{ExposeSecret, Secret};
use service_core::utils::{sign_payload, verify_payload};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::clock::Clock;
use super::error::{with_deadline, ServiceError};
use super::store::SharedStore;
use crate::models::{LinkClaims, LinkPurpose, LinkSubject};

const SIGNING_DOMAIN: &[u8] = b"link.v1.";
const CONSUMED_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed token")]
    Malformed,
    #[error("wrong purpose")]
    WrongPurpose,
    #[error("expired")]
    Expired,
    #[error("already consumed")]
    AlreadyConsumed,
}

#[derive(Debug, Clone)]
pub struct IssuedLink {
    pub token: String,
    pub claims: LinkClaims,
}

#[derive(Clone)]
pub struct SignedLinkCodec {
    secret: Secret<String>,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl SignedLinkCodec {
    pub fn new(
        secret: Secret<String>,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            secret,
            store,
            clock,
            timeout,
        }
    }

    pub fn issue(
        &self,
        purpose: LinkPurpose,
        subject: LinkSubject,
        ttl: Duration,
    ) -> Result<IssuedLink, ServiceError> {
        if ttl.is_zero() {
            return Err(ServiceError::Validation("link TTL must be positive".into()));
        }
        let iat = self.clock.now_ms();
        let claims = LinkClaims {
            purpose,
            subject: subject.subject,
            tenant_id: subject.tenant_id,
            client_id: subject.client_id,
            attributes: subject.attributes,
            iat,
            exp: iat + ttl.as_millis() as i64,
            nonce: Uuid::new_v4().simple().to_string(),
        };

        let body = serde_json::to_vec(&claims)
            .map_err(|e| anyhow::anyhow!("Failed to encode link claims: {}", e))?;
        let signature = sign_payload(self.secret.expose_secret().as_bytes(), &signing_input(&body))?;
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(signature)
        );

        Ok(IssuedLink { token, claims })
    }

    /// Read-only check; safe to retry. A valid link stays valid up to and
    /// including its `exp` millisecond.
    pub async fn verify(
        &self,
        token: &str,
        expected: LinkPurpose,
    ) -> Result<LinkClaims, ServiceError> {
        let claims = self.decode(token)?;
        if claims.purpose != expected {
            return Err(LinkError::WrongPurpose.into());
        }
        if self.clock.now_ms() > claims.exp {
            return Err(LinkError::Expired.into());
        }
        let consumed = with_deadline(
            self.timeout,
            "link_ledger",
            self.store.exists(&consumed_key(&claims.nonce)),
        )
        .await?;
        if consumed {
            return Err(LinkError::AlreadyConsumed.into());
        }
        Ok(claims)
    }

    /// Marks the nonce used. Exactly one caller wins per nonce; every other
    /// caller gets `AlreadyConsumed`. Not retry-safe.
    pub async fn consume(&self, claims: &LinkClaims) -> Result<(), ServiceError> {
        let remaining = (claims.exp - self.clock.now_ms()).max(0) as u64;
        let ttl = Duration::from_millis(remaining) + CONSUMED_GRACE;
        let won = with_deadline(
            self.timeout,
            "link_ledger",
            self.store
                .set_if_absent(&consumed_key(&claims.nonce), &claims.subject, ttl),
        )
        .await?;
        if won {
            Ok(())
        } else {
            Err(LinkError::AlreadyConsumed.into())
        }
    }

    /// `verify` followed by `consume`.
    pub async fn redeem(
        &self,
        token: &str,
        expected: LinkPurpose,
    ) -> Result<LinkClaims, ServiceError> {
        let claims = self.verify(token, expected).await?;
        self.consume(&claims).await?;
        Ok(claims)
    }

    fn decode(&self, token: &str) -> Result<LinkClaims, LinkError> {
        let (body_b64, sig_b64) = token.trim().split_once('.').ok_or(LinkError::Malformed)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| LinkError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| LinkError::Malformed)?;

        let valid = verify_payload(
            self.secret.expose_secret().as_bytes(),
            &signing_input(&body),
            &signature,
        )
        .map_err(|_| LinkError::InvalidSignature)?;
        if !valid {
            return Err(LinkError::InvalidSignature);
        }

        // Only signed bytes are parsed.
        serde_json::from_slice(&body).map_err(|_| LinkError::Malformed)
    }
}

fn signing_input(body: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(SIGNING_DOMAIN.len() + body.len());
    input.extend_from_slice(SIGNING_DOMAIN);
    input.extend_from_slice(body);
    input
}

fn consumed_key(nonce: &str) -> String {
    format!("link:consumed:{}", nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::store::InMemoryStore;

    fn codec() -> (SignedLinkCodec, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let codec = SignedLinkCodec::new(
            Secret::new("0123456789abcdef0123456789abcdef".to_string()),
            store,
            clock.clone(),
            Duration::from_secs(1),
        );
        (codec, clock)
    }

    fn subject() -> LinkSubject {
        LinkSubject::new("principal-1", Uuid::new_v4(), Some("web".into()))
    }

    fn link_error(err: ServiceError) -> LinkError {
        match err {
            ServiceError::Link(reason) => reason,
            other => panic!("expected link error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_returns_issued_claims() {
        let (codec, _) = codec();
        let issued = codec
            .issue(
                LinkPurpose::Invite,
                subject().with_attribute("role_id", "r1"),
                Duration::from_secs(600),
            )
            .unwrap();
        let claims = codec.verify(&issued.token, LinkPurpose::Invite).await.unwrap();
        assert_eq!(claims, issued.claims);
        assert_eq!(claims.attribute("role_id"), Some("r1"));
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let (codec, _) = codec();
        let issued = codec
            .issue(LinkPurpose::Reset, subject(), Duration::from_secs(60))
            .unwrap();
        let (_, sig) = issued.token.split_once('.').unwrap();
        let mut forged = issued.claims.clone();
        forged.subject = "principal-2".into();
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let err = codec
            .verify(&format!("{body}.{sig}"), LinkPurpose::Reset)
            .await
            .unwrap_err();
        assert_eq!(link_error(err), LinkError::InvalidSignature);
    }

    #[tokio::test]
    async fn test_other_secret_rejected() {
        let (codec, clock) = codec();
        let issued = codec
            .issue(LinkPurpose::Reset, subject(), Duration::from_secs(60))
            .unwrap();
        let other = SignedLinkCodec::new(
            Secret::new("fedcba9876543210fedcba9876543210".to_string()),
            Arc::new(InMemoryStore::with_clock(clock.clone())),
            clock,
            Duration::from_secs(1),
        );
        let err = other.verify(&issued.token, LinkPurpose::Reset).await.unwrap_err();
        assert_eq!(link_error(err), LinkError::InvalidSignature);
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let (codec, _) = codec();
        for token in ["", "abc", "!!!.!!!", "a.b.c"] {
            let err = codec.verify(token, LinkPurpose::Reset).await.unwrap_err();
            assert!(matches!(
                link_error(err),
                LinkError::Malformed | LinkError::InvalidSignature
            ));
        }
    }

    #[tokio::test]
    async fn test_wrong_purpose_rejected() {
        let (codec, _) = codec();
        let issued = codec
            .issue(LinkPurpose::Reset, subject(), Duration::from_secs(60))
            .unwrap();
        let err = codec.verify(&issued.token, LinkPurpose::Invite).await.unwrap_err();
        assert_eq!(link_error(err), LinkError::WrongPurpose);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let (codec, clock) = codec();
        let issued = codec
            .issue(LinkPurpose::Reset, subject(), Duration::from_secs(60))
            .unwrap();

        clock.advance_ms(59_999);
        assert!(codec.verify(&issued.token, LinkPurpose::Reset).await.is_ok());
        clock.advance_ms(1);
        assert!(codec.verify(&issued.token, LinkPurpose::Reset).await.is_ok());
        clock.advance_ms(1);
        let err = codec.verify(&issued.token, LinkPurpose::Reset).await.unwrap_err();
        assert_eq!(link_error(err), LinkError::Expired);
    }

    #[tokio::test]
    async fn test_consume_once() {
        let (codec, _) = codec();
        let issued = codec
            .issue(LinkPurpose::Reset, subject(), Duration::from_secs(60))
            .unwrap();
        codec.redeem(&issued.token, LinkPurpose::Reset).await.unwrap();

        let err = codec.verify(&issued.token, LinkPurpose::Reset).await.unwrap_err();
        assert_eq!(link_error(err), LinkError::AlreadyConsumed);
        let err = codec.consume(&issued.claims).await.unwrap_err();
        assert_eq!(link_error(err), LinkError::AlreadyConsumed);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let (codec, _) = codec();
        assert!(matches!(
            codec.issue(LinkPurpose::Reset, subject(), Duration::ZERO),
            Err(ServiceError::Validation(_))
        ));
    }
}
