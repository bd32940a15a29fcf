//! Sliding-window abuse guard for the sensitive flows.
//!
//! The limiter never logs or audits; the calling flow records the denial.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::error::{with_deadline, ServiceError};
use super::store::SharedStore;
use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitClass {
    Login,
    Register,
    ForgotPassword,
    ResetPassword,
}

impl RateLimitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitClass::Login => "login",
            RateLimitClass::Register => "register",
            RateLimitClass::ForgotPassword => "forgot_password",
            RateLimitClass::ResetPassword => "reset_password",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    rules: RateLimitConfig,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, rules: RateLimitConfig, timeout: Duration) -> Self {
        Self {
            store,
            rules,
            timeout,
        }
    }

    pub fn rule(&self, class: RateLimitClass) -> RateLimitRule {
        self.rules.rule(class)
    }

    pub async fn admit(
        &self,
        class: RateLimitClass,
        identifier: &str,
    ) -> Result<Admission, ServiceError> {
        self.admit_with_rule(class, identifier, self.rule(class)).await
    }

    pub async fn admit_with_rule(
        &self,
        class: RateLimitClass,
        identifier: &str,
        rule: RateLimitRule,
    ) -> Result<Admission, ServiceError> {
        let key = bucket_key(class, identifier);
        let admission = with_deadline(
            self.timeout,
            "rate_limit_store",
            self.store.admit_in_window(&key, rule.limit, rule.window),
        )
        .await?;

        Ok(if admission.allowed {
            Admission::Allowed {
                remaining: rule.limit.saturating_sub(admission.count),
            }
        } else {
            Admission::Denied {
                retry_after: admission.retry_after,
            }
        })
    }
}

/// Raw identifiers never reach the store.
fn bucket_key(class: RateLimitClass, identifier: &str) -> String {
    let digest = Sha256::digest(identifier.trim().to_lowercase().as_bytes());
    format!("ratelimit:{}:{}", class.as_str(), hex::encode(digest))
}
