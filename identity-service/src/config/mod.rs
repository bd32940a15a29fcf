use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::SecuritySettings;
use crate::services::rate_limiter::{RateLimitClass, RateLimitRule};
use crate::services::security_audit::AuditConfig;

/// Shortest accepted link signing secret, in bytes.
pub const MIN_LINK_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_version: String,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub links: LinkConfig,
    pub rate_limit: RateLimitConfig,
    pub timeouts: TimeoutConfig,
    /// `None` leaves link delivery to an injected dispatcher.
    pub smtp: Option<SmtpConfig>,
    pub audit: AuditConfig,
    /// Defaults for tenants without their own settings.
    pub security: SecuritySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" | "local" => Ok(Environment::Dev),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(format!("Unknown environment: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub enum JwtSigningKey {
    /// RS256 key pair read from PEM files.
    Rsa {
        private_key_path: String,
        public_key_path: String,
    },
    /// HS256 shared secret.
    Hmac(Secret<String>),
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub issuer: String,
    pub signing: JwtSigningKey,
    pub access_token_minutes: i64,
    /// Hard ceiling, tenant session settings included.
    pub max_access_token_minutes: i64,
    pub refresh_token_days: i64,
    pub id_token_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub signing_secret: Secret<String>,
    /// Front-end base URL links point at.
    pub base_url: String,
    pub reset_ttl: Duration,
    pub invite_ttl: Duration,
    /// Ceiling for caller-supplied invite TTLs.
    pub max_invite_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub login: RateLimitRule,
    pub register: RateLimitRule,
    pub forgot_password: RateLimitRule,
    pub reset_password: RateLimitRule,
}

impl RateLimitConfig {
    pub fn rule(&self, class: RateLimitClass) -> RateLimitRule {
        match class {
            RateLimitClass::Login => self.login,
            RateLimitClass::Register => self.register,
            RateLimitClass::ForgotPassword => self.forgot_password,
            RateLimitClass::ResetPassword => self.reset_password,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: rule(5, 900),
            register: rule(3, 3600),
            forgot_password: rule(5, 3600),
            reset_password: rule(5, 3600),
        }
    }
}

fn rule(limit: u32, window_secs: u64) -> RateLimitRule {
    RateLimitRule {
        limit,
        window: Duration::from_secs(window_secs),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Bound on every directory and shared-store call.
    pub dependency: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dependency: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from: String,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let environment: Environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| common.environment.clone())
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let signing = match env::var("JWT_PRIVATE_KEY_PATH") {
            Ok(private_key_path) => JwtSigningKey::Rsa {
                private_key_path,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
            },
            Err(_) => JwtSigningKey::Hmac(Secret::new(get_env("JWT_HMAC_SECRET", None, is_prod)?)),
        };

        let smtp = match env::var("SMTP_HOST") {
            Ok(host) => Some(SmtpConfig {
                host,
                port: parse_env("SMTP_PORT", "587", is_prod)?,
                user: get_env("SMTP_USER", None, is_prod)?,
                password: Secret::new(get_env("SMTP_PASSWORD", None, is_prod)?),
                from: get_env("SMTP_FROM", None, is_prod)?,
            }),
            Err(_) => None,
        };

        let security = match env::var("SECURITY_SETTINGS_PATH") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("Failed to read {}: {}", path, e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("Invalid security settings in {}: {}", path, e))
                })?
            }
            Err(_) => SecuritySettings::default(),
        };

        let config = IdentityConfig {
            environment,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                issuer: get_env("JWT_ISSUER", Some("http://localhost:8080"), is_prod)?,
                signing,
                access_token_minutes: parse_env("JWT_ACCESS_TOKEN_MINUTES", "15", is_prod)?,
                max_access_token_minutes: parse_env("JWT_MAX_ACCESS_TOKEN_MINUTES", "60", is_prod)?,
                refresh_token_days: parse_env("JWT_REFRESH_TOKEN_DAYS", "7", is_prod)?,
                id_token_minutes: parse_env("JWT_ID_TOKEN_MINUTES", "15", is_prod)?,
            },
            links: LinkConfig {
                signing_secret: Secret::new(get_env("LINK_SIGNING_SECRET", None, is_prod)?),
                base_url: get_env("LINK_BASE_URL", Some("http://localhost:3000"), is_prod)?,
                reset_ttl: Duration::from_secs(parse_env("LINK_RESET_TTL_SECONDS", "1800", is_prod)?),
                invite_ttl: Duration::from_secs(parse_env("LINK_INVITE_TTL_SECONDS", "604800", is_prod)?),
                max_invite_ttl: Duration::from_secs(parse_env(
                    "LINK_MAX_INVITE_TTL_SECONDS",
                    "2592000",
                    is_prod,
                )?),
            },
            rate_limit: RateLimitConfig {
                login: rule(
                    parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", "5", is_prod)?,
                    parse_env("RATE_LIMIT_LOGIN_WINDOW_SECONDS", "900", is_prod)?,
                ),
                register: rule(
                    parse_env("RATE_LIMIT_REGISTER_ATTEMPTS", "3", is_prod)?,
                    parse_env("RATE_LIMIT_REGISTER_WINDOW_SECONDS", "3600", is_prod)?,
                ),
                forgot_password: rule(
                    parse_env("RATE_LIMIT_FORGOT_PASSWORD_ATTEMPTS", "5", is_prod)?,
                    parse_env("RATE_LIMIT_FORGOT_PASSWORD_WINDOW_SECONDS", "3600", is_prod)?,
                ),
                reset_password: rule(
                    parse_env("RATE_LIMIT_RESET_PASSWORD_ATTEMPTS", "5", is_prod)?,
                    parse_env("RATE_LIMIT_RESET_PASSWORD_WINDOW_SECONDS", "3600", is_prod)?,
                ),
            },
            timeouts: TimeoutConfig {
                dependency: Duration::from_millis(parse_env("DEPENDENCY_TIMEOUT_MS", "2000", is_prod)?),
            },
            smtp,
            audit: AuditConfig {
                buffer_capacity: parse_env("AUDIT_BUFFER_CAPACITY", "4096", false)?,
                batch_size: parse_env("AUDIT_BATCH_SIZE", "64", false)?,
                write_timeout: Duration::from_millis(parse_env("AUDIT_WRITE_TIMEOUT_MS", "2000", false)?),
            },
            security,
            common,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.links.signing_secret.expose_secret().len() < MIN_LINK_SECRET_BYTES {
            return Err(config_error(format!(
                "LINK_SIGNING_SECRET must be at least {MIN_LINK_SECRET_BYTES} bytes"
            )));
        }
        if let JwtSigningKey::Hmac(secret) = &self.jwt.signing {
            if secret.expose_secret().len() < MIN_LINK_SECRET_BYTES {
                return Err(config_error(format!(
                    "JWT_HMAC_SECRET must be at least {MIN_LINK_SECRET_BYTES} bytes"
                )));
            }
        }

        if self.jwt.access_token_minutes <= 0 {
            return Err(config_error("JWT_ACCESS_TOKEN_MINUTES must be positive"));
        }
        if self.jwt.access_token_minutes > self.jwt.max_access_token_minutes {
            return Err(config_error(
                "JWT_ACCESS_TOKEN_MINUTES must not exceed JWT_MAX_ACCESS_TOKEN_MINUTES",
            ));
        }
        if self.jwt.refresh_token_days <= 0 || self.jwt.id_token_minutes <= 0 {
            return Err(config_error("Token lifetimes must be positive"));
        }

        if self.links.reset_ttl.is_zero() || self.links.invite_ttl.is_zero() {
            return Err(config_error("Link TTLs must be positive"));
        }
        if self.links.invite_ttl > self.links.max_invite_ttl {
            return Err(config_error("LINK_INVITE_TTL_SECONDS exceeds the invite maximum"));
        }

        for class in [
            RateLimitClass::Login,
            RateLimitClass::Register,
            RateLimitClass::ForgotPassword,
            RateLimitClass::ResetPassword,
        ] {
            let rule = self.rate_limit.rule(class);
            if rule.limit == 0 || rule.window.is_zero() {
                return Err(config_error(format!(
                    "Rate limit for {} must have a positive threshold and window",
                    class.as_str()
                )));
            }
        }

        if self.timeouts.dependency.is_zero() {
            return Err(config_error("DEPENDENCY_TIMEOUT_MS must be positive"));
        }

        self.security
            .validate()
            .map_err(|e| config_error(format!("Invalid default security settings: {e}")))?;

        if self.environment == Environment::Prod && self.smtp.is_none() {
            tracing::warn!("SMTP is not configured; links will not be delivered by email");
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(message.into()))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(config_error(format!("{key} is required in production but not set")))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(config_error(format!("{key} is required but not set")))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| config_error(format!("{key} is invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> IdentityConfig {
        IdentityConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_version: "test".into(),
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".into(),
            },
            jwt: JwtConfig {
                issuer: "https://id.test".into(),
                signing: JwtSigningKey::Hmac(Secret::new("j".repeat(32))),
                access_token_minutes: 15,
                max_access_token_minutes: 60,
                refresh_token_days: 7,
                id_token_minutes: 15,
            },
            links: LinkConfig {
                signing_secret: Secret::new("l".repeat(32)),
                base_url: "http://localhost:3000".into(),
                reset_ttl: Duration::from_secs(1800),
                invite_ttl: Duration::from_secs(3600),
                max_invite_ttl: Duration::from_secs(86_400),
            },
            rate_limit: RateLimitConfig::default(),
            timeouts: TimeoutConfig::default(),
            smtp: None,
            audit: AuditConfig::default(),
            security: SecuritySettings::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_short_link_secret_rejected() {
        let mut config = valid();
        config.links.signing_secret = Secret::new("too-short".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_access_ttl_above_max_rejected() {
        let mut config = valid();
        config.jwt.access_token_minutes = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = valid();
        config.rate_limit.forgot_password.limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }
}
