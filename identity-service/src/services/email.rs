//! Delivery of signed links to their recipients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use secrecy::ExposeSecret;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::models::LinkPurpose;

/// A rendered link ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub to: String,
    pub purpose: LinkPurpose,
    pub link: String,
    pub expires_at: DateTime<Utc>,
    pub tenant_id: Uuid,
}

#[async_trait]
pub trait LinkDispatcher: Send + Sync {
    async fn dispatch(&self, message: &LinkMessage) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct SmtpLinkDispatcher {
    mailer: SmtpTransport,
    from_email: String,
}

impl SmtpLinkDispatcher {
    pub fn new(config: &crate::config::SmtpConfig) -> Result<Self, anyhow::Error> {
        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );

        let mailer = SmtpTransport::relay(&config.host)
            .map_err(|e| anyhow::anyhow!("Invalid SMTP relay {}: {}", config.host, e))?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, "SMTP link dispatcher initialized");

        Ok(Self {
            mailer,
            from_email: config.from.clone(),
        })
    }
}

fn render(message: &LinkMessage) -> (&'static str, String) {
    let expires = message.expires_at.format("%Y-%m-%d %H:%M UTC");
    match message.purpose {
        LinkPurpose::Reset => (
            "Reset your password",
            format!(
                "A password reset was requested for this address.\n\n\
                 Open the following link to choose a new password:\n\n{}\n\n\
                 The link can be used once and expires at {}. \
                 If you did not ask for this, ignore this message.",
                message.link, expires
            ),
        ),
        LinkPurpose::Invite => (
            "You have been invited",
            format!(
                "You have been invited to create an account.\n\n\
                 Open the following link to register:\n\n{}\n\n\
                 The link can be used once and expires at {}.",
                message.link, expires
            ),
        ),
    }
}

#[async_trait]
impl LinkDispatcher for SmtpLinkDispatcher {
    async fn dispatch(&self, message: &LinkMessage) -> Result<(), anyhow::Error> {
        let (subject, body) = render(message);
        let email = Message::builder()
            .from(self.from_email.parse()?)
            .to(message.to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)?;

        // SMTP transport is blocking.
        let mailer = self.mailer.clone();
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| anyhow::anyhow!("Mail task failed: {}", e))?
            .map_err(|e| {
                tracing::error!(error = %e, purpose = message.purpose.as_str(), "Failed to send link");
                anyhow::anyhow!("Failed to send link: {}", e)
            })?;

        tracing::info!(purpose = message.purpose.as_str(), "Link sent");
        Ok(())
    }
}

/// Records messages instead of sending them.
#[derive(Debug, Default)]
pub struct MockLinkDispatcher {
    sent: Mutex<Vec<LinkMessage>>,
    failing: std::sync::atomic::AtomicBool,
    delay: Mutex<Duration>,
}

impl MockLinkDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<LinkMessage> {
        self.sent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Holds every delivery for `delay` before recording it.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkDispatcher for MockLinkDispatcher {
    async fn dispatch(&self, message: &LinkMessage) -> Result<(), anyhow::Error> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Mock dispatcher failure"));
        }
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock dispatcher mutex poisoned: {}", e))?
            .push(message.clone());
        Ok(())
    }
}
