//! Signed link claim set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What a signed link may be redeemed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPurpose {
    Reset,
    Invite,
}

impl LinkPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkPurpose::Reset => "reset",
            LinkPurpose::Invite => "invite",
        }
    }
}

/// Caller supplied part of the claim set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSubject {
    /// Principal id for resets, invitee email for invites.
    pub subject: String,
    pub tenant_id: Uuid,
    pub client_id: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl LinkSubject {
    pub fn new(subject: impl Into<String>, tenant_id: Uuid, client_id: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            tenant_id,
            client_id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Full claim set carried by a signed link.
///
/// Field order is part of the signed byte string; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkClaims {
    #[serde(rename = "pur")]
    pub purpose: LinkPurpose,
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(rename = "tid")]
    pub tenant_id: Uuid,
    #[serde(rename = "cid", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "att", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Issued at, unix milliseconds.
    pub iat: i64,
    /// Expires at, unix milliseconds.
    pub exp: i64,
    #[serde(rename = "jti")]
    pub nonce: String,
}

impl LinkClaims {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Attribute key carrying the role pre-assigned by an invite.
pub const INVITE_ROLE_ATTRIBUTE: &str = "role_id";
