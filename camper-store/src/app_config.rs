use camper_catalog::Catalog;
use camper_order::EngineConfig;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// Without a database the API runs on the in-memory repository.
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub kafka: Option<KafkaConfig>,
    pub auth: AuthConfig,
    pub payment: PaymentConfig,
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub catalog: Catalog,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Requests per caller per minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 { 120 }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_refund_group")]
    pub refund_consumer_group: String,
}

fn default_refund_group() -> String { "camper-refunds".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentConfig {
    pub channel_timeout_ms: u64,
    pub stale_attempt_after_seconds: i64,
    pub recovery_interval_seconds: u64,
    /// Shared secret the payment channel sends in `X-Webhook-Secret`.
    pub webhook_secret: String,
    /// Sandbox channel declines charges above this many minor units.
    pub sandbox_decline_above: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractsConfig {
    pub signature_session_ttl_seconds: i64,
    #[serde(default)]
    pub accept_signed_contracts: bool,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional.
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in.
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `CAMPER_AUTH__JWT_SECRET=...`
            .add_source(config::Environment::with_prefix("CAMPER").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            channel_timeout: Duration::from_millis(self.payment.channel_timeout_ms),
            stale_attempt_after: chrono::Duration::seconds(self.payment.stale_attempt_after_seconds),
            signature_session_ttl: chrono::Duration::seconds(self.contracts.signature_session_ttl_seconds),
            accept_signed_contracts: self.contracts.accept_signed_contracts,
        }
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.payment.recovery_interval_seconds.max(1))
    }
}
