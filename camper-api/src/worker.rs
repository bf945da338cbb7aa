use camper_core::{PaymentChannel, RefundOutcome};
use camper_order::events::TOPIC_REFUND_REQUESTED;
use camper_order::{DomainEvent, Engine, EventPublisher};
use camper_shared::models::events::{ReconciliationRequiredEvent, RefundRequestedEvent};
use chrono::Utc;
use futures_util::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::metrics::Metrics;

/// Periodically reconcile attempts and refunds left open by timeouts or a
/// previous crash.
pub async fn start_recovery_worker(engine: Engine, every: Duration, metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately; start-up already ran a pass.
    ticker.tick().await;

    info!("Recovery worker started, running every {:?}", every);
    loop {
        ticker.tick().await;
        let report = engine.run_recovery().await;
        metrics.observe_recovery(&report);
        if !report.is_clean() {
            warn!(
                "Recovery left {} attempts and {} recharges unresolved with {} errors",
                report.unresolved.len(),
                report.recharges_unresolved.len(),
                report.errors.len()
            );
        }
    }
}

/// Executes channel refunds requested by cancellations and rejections.
/// Offsets are committed only after a refund has been handled or escalated.
pub async fn start_refund_worker(
    brokers: String,
    group_id: String,
    channel: Arc<dyn PaymentChannel>,
    events: Arc<dyn EventPublisher>,
) -> Result<(), rdkafka::error::KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .set("group.id", &group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;

    consumer.subscribe(&[TOPIC_REFUND_REQUESTED])?;

    info!("Refund worker started, listening to {}...", TOPIC_REFUND_REQUESTED);

    let mut stream = consumer.stream();
    while let Some(message) = stream.next().await {
        let m = match message {
            Ok(m) => m,
            Err(e) => {
                error!("Kafka error: {}", e);
                continue;
            }
        };
        match m.payload_view::<str>() {
            Some(Ok(payload)) => match parse_refund(payload) {
                Ok(request) => {
                    dispatch_refund(channel.as_ref(), events.as_ref(), &request).await;
                }
                Err(e) => error!("Malformed refund request: {}", e),
            },
            Some(Err(e)) => error!("Error reading payload: {}", e),
            None => {}
        }
        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
            error!("Failed to commit refund offset {}: {}", m.offset(), e);
        }
    }
    Ok(())
}

pub fn parse_refund(payload: &str) -> Result<RefundRequestedEvent, serde_json::Error> {
    serde_json::from_str(payload)
}

/// Execute one refund. A refund the channel does not confirm is escalated
/// as RECONCILIATION_REQUIRED. Returns whether the channel confirmed it.
pub async fn dispatch_refund(
    channel: &dyn PaymentChannel,
    events: &dyn EventPublisher,
    request: &RefundRequestedEvent,
) -> bool {
    let reason = match channel.refund(&request.external_transaction_id, request.amount).await {
        Ok(RefundOutcome::Succeeded) => {
            info!(
                "Refunded {} on {} for order {}",
                request.amount, request.external_transaction_id, request.order_id
            );
            return true;
        }
        Ok(RefundOutcome::Failed { reason }) => format!(
            "channel refused refund of {} on {}: {}",
            request.amount, request.external_transaction_id, reason
        ),
        Err(e) => format!(
            "refund of {} on {} failed: {}",
            request.amount, request.external_transaction_id, e
        ),
    };

    error!("Refund for order {} needs reconciliation: {}", request.order_id, reason);
    let event = DomainEvent::ReconciliationRequired(ReconciliationRequiredEvent {
        order_id: Some(request.order_id),
        attempt_id: Some(request.attempt_id),
        account_id: None,
        reason,
        timestamp: Utc::now().timestamp(),
    });
    if let Err(e) = events.publish(&event).await {
        error!("Failed to escalate refund for order {}: {}", request.order_id, e);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use camper_core::{ChannelError, ChargeOutcome, ChargeRequest, ChargeStatus, SandboxChannel};
    use camper_order::RecordingPublisher;
    use camper_shared::Money;
    use uuid::Uuid;

    /// Channel whose refunds never go through.
    struct RefusingRefunds;

    #[async_trait]
    impl PaymentChannel for RefusingRefunds {
        async fn charge(&self, _request: &ChargeRequest) -> Result<ChargeOutcome, ChannelError> {
            Err(ChannelError::Rejected("charges disabled".to_string()))
        }

        async fn refund(&self, _external_transaction_id: &str, _amount: Money) -> Result<RefundOutcome, ChannelError> {
            Ok(RefundOutcome::Failed { reason: "original charge is too old".to_string() })
        }

        async fn charge_status(&self, _reference: &str) -> Result<ChargeStatus, ChannelError> {
            Ok(ChargeStatus::NotFound)
        }
    }

    fn refund_request() -> RefundRequestedEvent {
        RefundRequestedEvent {
            order_id: Uuid::new_v4(),
            attempt_id: Uuid::new_v4(),
            external_transaction_id: "wx_123".to_string(),
            amount: Money::from_minor(20000),
            method: "WECHAT".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_failed_refund_is_escalated() {
        let events = RecordingPublisher::new();
        let request = refund_request();

        assert!(!dispatch_refund(&RefusingRefunds, &events, &request).await);

        let published = events.events();
        assert_eq!(published.len(), 1);
        match &published[0] {
            DomainEvent::ReconciliationRequired(event) => {
                assert_eq!(event.order_id, Some(request.order_id));
                assert_eq!(event.attempt_id, Some(request.attempt_id));
                assert!(event.reason.contains("too old"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_confirmed_refund_publishes_nothing() {
        let events = RecordingPublisher::new();
        assert!(dispatch_refund(&SandboxChannel::new(), &events, &refund_request()).await);
        assert!(events.events().is_empty());
    }

    #[test]
    fn test_parse_refund_payload() {
        let order_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "order_id": order_id,
            "attempt_id": Uuid::new_v4(),
            "external_transaction_id": "wx_123",
            "amount": 20000,
            "method": "WECHAT",
            "timestamp": 1_700_000_000,
        })
        .to_string();

        let request = parse_refund(&payload).unwrap();
        assert_eq!(request.order_id, order_id);
        assert_eq!(request.amount, Money::from_minor(20000));
        assert!(parse_refund("{\"order_id\": 1}").is_err());
    }
}
