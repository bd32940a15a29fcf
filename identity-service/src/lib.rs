pub mod config;
pub mod dtos;
pub mod models;
pub mod services;
pub mod utils;

use service_core::error::AppError;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::IdentityConfig;
use crate::services::{
    AccessDirectory, AuditSink, AuthService, Clock, IdentityDirectory, LinkDispatcher,
    RedisStore, SecurityAuditService, SharedStore, SmtpLinkDispatcher, SystemClock,
    TracingAuditSink,
};

/// External collaborators the engine calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityDirectory>,
    pub access: Arc<dyn AccessDirectory>,
    pub store: Arc<dyn SharedStore>,
    pub dispatcher: Arc<dyn LinkDispatcher>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Production wiring: Redis for shared state and SMTP for link delivery,
    /// around a directory supplied by the persistence layer.
    pub async fn connect(
        config: &IdentityConfig,
        identity: Arc<dyn IdentityDirectory>,
        access: Arc<dyn AccessDirectory>,
    ) -> Result<Self, AppError> {
        let store = RedisStore::new(&config.redis).await.map_err(|e| {
            tracing::error!("Failed to connect to Redis: {}", e);
            AppError::ConfigError(e)
        })?;
        let smtp = config.smtp.as_ref().ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("SMTP_HOST is required for link delivery"))
        })?;
        let dispatcher = SmtpLinkDispatcher::new(smtp)
            .map_err(|e| AppError::EmailError(e.to_string()))?;

        Ok(Self {
            identity,
            access,
            store: Arc::new(store),
            dispatcher: Arc::new(dispatcher),
            clock: Arc::new(SystemClock),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub auth_service: AuthService,
    pub audit: SecurityAuditService,
    pub store: Arc<dyn SharedStore>,
}

/// Assembles the engine. Must run inside a Tokio runtime; the returned handle
/// is the audit writer, which finishes once every `AppState` clone is dropped.
pub fn build_state(
    config: IdentityConfig,
    collaborators: Collaborators,
    sink: Arc<dyn AuditSink>,
) -> Result<(AppState, JoinHandle<()>), AppError> {
    let (audit, writer) = SecurityAuditService::spawn(sink, config.audit);
    let auth_service = AuthService::new(&config, &collaborators, audit.clone())
        .map_err(AppError::ConfigError)?;

    tracing::info!(
        service = %config.common.service_name,
        version = %config.service_version,
        "Identity engine initialized"
    );

    Ok((
        AppState {
            config,
            auth_service,
            audit,
            store: collaborators.store,
        },
        writer,
    ))
}

/// Loads configuration from the environment, installs tracing and connects
/// the production collaborators.
pub async fn bootstrap(
    identity: Arc<dyn IdentityDirectory>,
    access: Arc<dyn AccessDirectory>,
) -> Result<(AppState, JoinHandle<()>), AppError> {
    let config = IdentityConfig::from_env()?;
    service_core::observability::init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )
    .map_err(AppError::ConfigError)?;

    let collaborators = Collaborators::connect(&config, identity, access).await?;
    build_state(config, collaborators, Arc::new(TracingAuditSink))
}

/// Readiness of the shared store within the dependency timeout.
pub async fn health_check(state: &AppState) -> Result<(), AppError> {
    let limit = state.config.timeouts.dependency;
    match tokio::time::timeout(limit, state.store.health_check()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Shared store health check failed");
            Err(AppError::ServiceUnavailable)
        }
        Err(_) => {
            tracing::warn!("Shared store health check timed out");
            Err(AppError::ServiceUnavailable)
        }
    }
}
