pub mod client;
pub mod context;
pub mod lifecycle;
pub mod link;
pub mod permission;
pub mod role;
pub mod security_event;
pub mod settings;
pub mod tenant;
pub mod user;

pub use client::AuthClient;
pub use context::RequestContext;
pub use lifecycle::{Immutability, Lifecycle, LifecycleError, Status};
pub use link::{LinkClaims, LinkPurpose, LinkSubject, INVITE_ROLE_ATTRIBUTE};
pub use permission::{ApiResource, GrantedPermission, Permission, PermissionSet};
pub use role::{Role, RoleAssignment};
pub use security_event::{SecurityEvent, SecurityEventType, Severity};
pub use settings::{
    GeneralSettings, IpSettings, PasswordSettings, SecuritySettings, SessionSettings,
    SettingsError, SettingsUpdate, ThreatSettings,
};
pub use tenant::Tenant;
pub use user::{NewPrincipal, Principal, PrincipalCreation};
