use camper_order::Engine;
use camper_store::RedisClient;
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::webhooks::DeliveryLog;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Rate limiting is skipped without Redis.
    pub redis: Option<Arc<RedisClient>>,
    /// Webhook de-duplication is skipped without a delivery log.
    pub deliveries: Option<Arc<dyn DeliveryLog>>,
    pub auth: AuthConfig,
    pub webhook_secret: String,
    pub rate_limit_per_minute: i64,
    pub metrics: Arc<Metrics>,
}
