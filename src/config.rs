use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::Validate;

const DEFAULT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Card gateway (hosted checkout) provider configuration.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CardGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Secret used to verify signed webhook envelopes
    pub webhook_secret: String,
    /// Accepted clock skew for signed webhook timestamps, seconds
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

/// Mobile-money provider configuration (OAuth2 client credentials).
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct MobileMoneyConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub merchant_id: String,
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

/// External B2B inventory system configuration.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct B2bConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Active API keys accepted on the inbound status webhook
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Fallback site configuration when an order carries none
    pub default_site_configuration: i64,
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
    #[serde(default = "default_b2b_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Cooldown between catalog sync runs, seconds
    #[serde(default = "default_catalog_sync_cooldown_secs")]
    pub catalog_sync_cooldown_secs: u64,
}

/// Application configuration, layered from config files and `APP__*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret for validating caller bearer tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// ISO currency code used with payment providers
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Number of minor-unit digits for the currency (e.g. 2 for DZD centimes)
    #[serde(default = "default_currency_exponent")]
    pub currency_exponent: u32,

    /// Public base URL used to build provider return / notify URLs
    pub public_base_url: String,

    /// TTL of the webhook replay-dedup store, seconds. Must cover the
    /// longest provider retry window.
    #[serde(default = "default_webhook_dedup_ttl_secs")]
    pub webhook_dedup_ttl_secs: u64,

    pub card_gateway: CardGatewayConfig,
    pub mobile_money: MobileMoneyConfig,
    pub b2b: B2bConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_currency() -> String {
    "DZD".to_string()
}
fn default_currency_exponent() -> u32 {
    2
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}
fn default_token_timeout_secs() -> u64 {
    30
}
fn default_session_timeout_secs() -> u64 {
    15
}
fn default_b2b_timeout_secs() -> u64 {
    15
}
fn default_webhook_dedup_ttl_secs() -> u64 {
    24 * 3600
}
fn default_catalog_sync_cooldown_secs() -> u64 {
    600
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("public_base_url", "http://localhost:8080")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET with a secure random string.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("checkout_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);
    let filter = EnvFilter::try_new(filter_directive).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            jwt_secret: "a".repeat(64),
            host: "127.0.0.1".into(),
            port: 8080,
            environment: "test".into(),
            log_level: "debug".into(),
            log_json: false,
            currency: "DZD".into(),
            currency_exponent: 2,
            public_base_url: "http://localhost:8080".into(),
            webhook_dedup_ttl_secs: default_webhook_dedup_ttl_secs(),
            card_gateway: CardGatewayConfig {
                base_url: "https://gateway.test".into(),
                api_key: "sk_test".into(),
                webhook_secret: "whsec".into(),
                webhook_tolerance_secs: 300,
                session_timeout_secs: 15,
            },
            mobile_money: MobileMoneyConfig {
                base_url: "https://momo.test".into(),
                client_id: "cid".into(),
                client_secret: "cs".into(),
                merchant_id: "m-1".into(),
                token_timeout_secs: 30,
                session_timeout_secs: 15,
            },
            b2b: B2bConfig {
                base_url: "https://b2b.test".into(),
                client_id: "cid".into(),
                client_secret: "cs".into(),
                api_keys: vec!["key-1".into()],
                default_site_configuration: 18,
                token_timeout_secs: 30,
                request_timeout_secs: 15,
                catalog_sync_cooldown_secs: 600,
            },
        }
    }

    #[test]
    fn sample_config_validates() {
        sample_config().validate().expect("config should validate");
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let mut cfg = sample_config();
        cfg.jwt_secret = "short".into();
        assert!(cfg.validate().is_err());
    }
}
