use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Settings shared by every service in the workspace.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// OTLP collector endpoint; span export is disabled when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_service_name() -> String {
    "identity-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            environment: default_environment(),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
