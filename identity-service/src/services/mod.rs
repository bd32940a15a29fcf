//! Services layer for the identity engine.
//!
//! Flow orchestration lives in [`auth`]; everything else is a component it
//! calls into or a collaborator seam with an in-memory implementation.

pub mod auth;
pub mod clock;
pub mod credentials;
pub mod directory;
pub mod email;
pub mod error;
pub mod jwt;
pub mod permissions;
pub mod policy;
pub mod rate_limiter;
pub mod security_audit;
pub mod signed_link;
pub mod store;
pub mod tenant_resolver;

pub use auth::AuthService;
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialError, CredentialVerifier};
pub use directory::{AccessDirectory, IdentityDirectory, InMemoryDirectory};
pub use email::{LinkDispatcher, LinkMessage, MockLinkDispatcher, SmtpLinkDispatcher};
pub use error::ServiceError;
pub use jwt::{AccessTokenClaims, IdTokenClaims, RefreshTokenClaims, TokenIssuer, TokenTriad};
pub use permissions::PermissionResolver;
pub use policy::{PasswordPolicy, PolicyError};
pub use rate_limiter::{Admission, RateLimitClass, RateLimitRule, RateLimiter};
pub use security_audit::{
    AuditConfig, AuditSink, MemoryAuditSink, SecurityAuditService, TracingAuditSink,
};
pub use signed_link::{IssuedLink, LinkError, SignedLinkCodec};
pub use store::{InMemoryStore, RedisStore, SharedStore, WindowAdmission};
pub use tenant_resolver::{ResolvedScope, ScopeRequest, TenantResolver};
