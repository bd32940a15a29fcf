//! Per-tenant security settings.
//!
//! Each category is a closed struct: unknown keys are rejected when a settings
//! document is parsed, and every category validates its own ranges.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{category}.{field}: {reason}")]
    InvalidValue {
        category: &'static str,
        field: &'static str,
        reason: String,
    },
}

fn invalid(category: &'static str, field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue {
        category,
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralSettings {
    pub allow_self_registration: bool,
    /// Login is refused for principals that have not verified their email.
    pub require_verified_email: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            allow_self_registration: true,
            require_verified_email: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PasswordSettings {
    pub min_length: usize,
    pub max_length: usize,
    pub require_uppercase: bool,
    pub require_number: bool,
    pub require_special: bool,
}

impl Default for PasswordSettings {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
            require_uppercase: true,
            require_number: true,
            require_special: false,
        }
    }
}

impl PasswordSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.min_length < 8 {
            return Err(invalid("password", "min_length", "must be at least 8"));
        }
        if self.max_length < self.min_length {
            return Err(invalid("password", "max_length", "must not be below min_length"));
        }
        if self.max_length > 1024 {
            return Err(invalid("password", "max_length", "must not exceed 1024"));
        }
        Ok(())
    }
}

/// Token lifetimes. `None` falls back to the service-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    pub access_token_minutes: Option<i64>,
    pub refresh_token_days: Option<i64>,
}

impl SessionSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if matches!(self.access_token_minutes, Some(m) if m <= 0) {
            return Err(invalid("session", "access_token_minutes", "must be positive"));
        }
        if matches!(self.refresh_token_days, Some(d) if d <= 0) {
            return Err(invalid("session", "refresh_token_days", "must be positive"));
        }
        Ok(())
    }
}

/// Login throttling overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThreatSettings {
    pub max_login_attempts: Option<u32>,
    pub login_window_seconds: Option<u64>,
}

impl ThreatSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_login_attempts == Some(0) {
            return Err(invalid("threat", "max_login_attempts", "must be positive"));
        }
        if self.login_window_seconds == Some(0) {
            return Err(invalid("threat", "login_window_seconds", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpSettings {
    pub blocked: Vec<IpAddr>,
    /// When non-empty, only these addresses may log in.
    pub allowed: Vec<IpAddr>,
}

impl IpSettings {
    pub fn permits(&self, ip: Option<IpAddr>) -> bool {
        match ip {
            Some(ip) => {
                !self.blocked.contains(&ip) && (self.allowed.is_empty() || self.allowed.contains(&ip))
            }
            // An unknown origin cannot satisfy an allow list.
            None => self.allowed.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySettings {
    pub general: GeneralSettings,
    pub password: PasswordSettings,
    pub session: SessionSettings,
    pub threat: ThreatSettings,
    pub ip: IpSettings,
}

impl SecuritySettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.password.validate()?;
        self.session.validate()?;
        self.threat.validate()
    }

    /// Replaces one category after validating it.
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<(), SettingsError> {
        update.validate()?;
        match update {
            SettingsUpdate::General(s) => self.general = s,
            SettingsUpdate::Password(s) => self.password = s,
            SettingsUpdate::Session(s) => self.session = s,
            SettingsUpdate::Threat(s) => self.threat = s,
            SettingsUpdate::Ip(s) => self.ip = s,
        }
        Ok(())
    }
}

/// A single-category settings update, e.g.
/// `{"category": "threat", "settings": {"max_login_attempts": 3}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "settings", rename_all = "lowercase", deny_unknown_fields)]
pub enum SettingsUpdate {
    General(GeneralSettings),
    Password(PasswordSettings),
    Session(SessionSettings),
    Threat(ThreatSettings),
    Ip(IpSettings),
}

impl SettingsUpdate {
    pub fn validate(&self) -> Result<(), SettingsError> {
        match self {
            SettingsUpdate::General(_) | SettingsUpdate::Ip(_) => Ok(()),
            SettingsUpdate::Password(s) => s.validate(),
            SettingsUpdate::Session(s) => s.validate(),
            SettingsUpdate::Threat(s) => s.validate(),
        }
    }
}
