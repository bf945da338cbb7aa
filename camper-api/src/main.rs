use anyhow::Context;
use camper_api::{app, metrics::Metrics, webhooks::DeliveryLog, worker, AppState, AuthConfig};
use camper_core::{PaymentChannel, SandboxChannel};
use camper_order::{Engine, EngineRepository, EventPublisher, InMemoryRepository, NoopPublisher};
use camper_shared::Money;
use camper_store::{app_config::Config, DbClient, EventProducer, PgEngineRepository, RedisClient};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camper_api=debug,camper_order=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Camper API on port {}", config.server.port);

    let repo: Arc<dyn EngineRepository> = match &config.database {
        Some(database) => {
            let db = DbClient::new(database).await.context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;
            Arc::new(PgEngineRepository::new(db.pool.clone()))
        }
        None => {
            tracing::warn!("No database configured; state lives in process memory");
            Arc::new(InMemoryRepository::new())
        }
    };

    let redis = match &config.redis {
        Some(redis) => Some(Arc::new(
            RedisClient::new(&redis.url).await.context("Failed to connect to Redis")?,
        )),
        None => None,
    };

    let events: Arc<dyn EventPublisher> = match &config.kafka {
        Some(kafka) => Arc::new(EventProducer::new(&kafka.brokers).context("Failed to create Kafka producer")?),
        None => {
            tracing::warn!("No Kafka configured; domain events are dropped");
            Arc::new(NoopPublisher)
        }
    };

    // Real WeChat Pay / Alipay adapters plug in here.
    let channel: Arc<dyn PaymentChannel> = Arc::new(match config.payment.sandbox_decline_above {
        Some(limit) => SandboxChannel::declining_above(Money::from_minor(limit)),
        None => SandboxChannel::new(),
    });

    let engine = Engine::new(repo, channel.clone(), events.clone(), &config.catalog, config.engine_config());
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    // Settle anything a previous process left in flight before taking traffic.
    let report = engine.run_recovery().await;
    metrics.observe_recovery(&report);

    tokio::spawn(worker::start_recovery_worker(
        engine.clone(),
        config.recovery_interval(),
        metrics.clone(),
    ));

    if let Some(kafka) = &config.kafka {
        let brokers = kafka.brokers.clone();
        let group_id = kafka.refund_consumer_group.clone();
        let channel = channel.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = worker::start_refund_worker(brokers, group_id, channel, events).await {
                tracing::error!("Refund worker stopped: {}", e);
            }
        });
    }

    let app_state = AppState {
        engine,
        rate_limit_per_minute: config.redis.as_ref().map_or(0, |r| r.rate_limit_per_minute),
        deliveries: redis.clone().map(|r| r as Arc<dyn DeliveryLog>),
        redis,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
        webhook_secret: config.payment.webhook_secret.clone(),
        metrics,
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
