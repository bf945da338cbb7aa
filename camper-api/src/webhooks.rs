use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use async_trait::async_trait;
use camper_order::{ChannelOutcome, EngineError, ErrorKind};
use camper_store::RedisClient;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
const DELIVERY_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Remembers which webhook deliveries have already been handled.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// `false` when the delivery is already claimed.
    async fn claim(&self, delivery_id: &str) -> anyhow::Result<bool>;
    /// Drop a claim so a redelivery is processed again.
    async fn release(&self, delivery_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl DeliveryLog for RedisClient {
    async fn claim(&self, delivery_id: &str) -> anyhow::Result<bool> {
        Ok(self.claim_delivery(delivery_id, DELIVERY_TTL_SECONDS).await?)
    }

    async fn release(&self, delivery_id: &str) -> anyhow::Result<()> {
        Ok(self.release_delivery(delivery_id).await?)
    }
}

/// Asynchronous charge notification from the payment channel.
#[derive(Debug, Deserialize)]
pub struct PaymentWebhook {
    /// Channel-side delivery id, used to drop redelivered notifications.
    pub delivery_id: Option<String>,
    /// The charge reference the engine sent, i.e. the attempt id.
    pub attempt_id: Uuid,
    #[serde(flatten)]
    pub outcome: ChannelOutcome,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub attempt_id: Uuid,
    pub status: &'static str,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhooks/payments", post(handle_payment_webhook))
}

/// POST /v1/webhooks/payments
async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PaymentWebhook>,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    let secret = headers.get(WEBHOOK_SECRET_HEADER).and_then(|h| h.to_str().ok());
    if secret != Some(state.webhook_secret.as_str()) {
        return Err(AppError::Authentication("bad webhook secret".to_string()));
    }

    tracing::info!("Received payment webhook for attempt {}: {:?}", payload.attempt_id, payload.outcome);

    let claimed = match (state.deliveries.as_ref(), payload.delivery_id.as_deref()) {
        (Some(log), Some(delivery_id)) => match log.claim(delivery_id).await {
            Ok(false) => {
                tracing::info!("Dropping redelivered webhook {}", delivery_id);
                return Ok((
                    StatusCode::OK,
                    Json(WebhookAck { attempt_id: payload.attempt_id, status: "DUPLICATE" }),
                ));
            }
            Ok(true) => Some((log, delivery_id)),
            // Resolution is idempotent, so a missing de-dup check is harmless.
            Err(e) => {
                tracing::warn!("Webhook de-duplication unavailable: {}", e);
                None
            }
        },
        _ => None,
    };

    let result = state.engine.resolve_attempt(payload.attempt_id, payload.outcome).await;
    // A delivery that was not applied must stay eligible for redelivery.
    if let (Err(err), Some((log, delivery_id))) = (&result, claimed) {
        if !matches!(err, EngineError::ReconciliationRequired(_)) {
            if let Err(e) = log.release(delivery_id).await {
                tracing::warn!("Could not release webhook delivery {}: {}", delivery_id, e);
            }
        }
    }

    match result {
        Ok(resolution) => Ok((
            StatusCode::OK,
            Json(WebhookAck { attempt_id: payload.attempt_id, status: resolution.attempt.status.as_str() }),
        )),
        // Recorded and escalated; redelivery would not change anything.
        Err(err @ EngineError::ReconciliationRequired(_)) => {
            tracing::error!("Webhook for attempt {} needs reconciliation: {}", payload.attempt_id, err);
            Ok((
                StatusCode::ACCEPTED,
                Json(WebhookAck {
                    attempt_id: payload.attempt_id,
                    status: ErrorKind::ReconciliationRequired.as_str(),
                }),
            ))
        }
        Err(err) => Err(err.into()),
    }
}
