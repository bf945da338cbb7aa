use async_trait::async_trait;
use camper_shared::models::events::{
    ContractSignedEvent, OrderPaidEvent, OrderStatusChangedEvent, ReconciliationRequiredEvent,
    RefundRequestedEvent, WithdrawalRequestedEvent,
};
use serde::Serialize;
use std::sync::Mutex;

pub const TOPIC_ORDER_STATUS_CHANGED: &str = "orders.status_changed";
pub const TOPIC_ORDER_PAID: &str = "orders.paid";
pub const TOPIC_REFUND_REQUESTED: &str = "payments.refund_requested";
pub const TOPIC_RECONCILIATION_REQUIRED: &str = "payments.reconciliation_required";
pub const TOPIC_CONTRACT_SIGNED: &str = "contracts.signed";
pub const TOPIC_WITHDRAWAL_REQUESTED: &str = "wallet.withdrawal_requested";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainEvent {
    OrderStatusChanged(OrderStatusChangedEvent),
    OrderPaid(OrderPaidEvent),
    RefundRequested(RefundRequestedEvent),
    ReconciliationRequired(ReconciliationRequiredEvent),
    ContractSigned(ContractSignedEvent),
    WithdrawalRequested(WithdrawalRequestedEvent),
}

impl DomainEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::OrderStatusChanged(_) => TOPIC_ORDER_STATUS_CHANGED,
            DomainEvent::OrderPaid(_) => TOPIC_ORDER_PAID,
            DomainEvent::RefundRequested(_) => TOPIC_REFUND_REQUESTED,
            DomainEvent::ReconciliationRequired(_) => TOPIC_RECONCILIATION_REQUIRED,
            DomainEvent::ContractSigned(_) => TOPIC_CONTRACT_SIGNED,
            DomainEvent::WithdrawalRequested(_) => TOPIC_WITHDRAWAL_REQUESTED,
        }
    }

    /// Partition key: events about one entity stay ordered.
    pub fn key(&self) -> String {
        match self {
            DomainEvent::OrderStatusChanged(e) => e.order_id.to_string(),
            DomainEvent::OrderPaid(e) => e.order_id.to_string(),
            DomainEvent::RefundRequested(e) => e.order_id.to_string(),
            DomainEvent::ReconciliationRequired(e) => e
                .order_id
                .map(|id| id.to_string())
                .or_else(|| e.account_id.clone())
                .unwrap_or_default(),
            DomainEvent::ContractSigned(e) => e.order_id.to_string(),
            DomainEvent::WithdrawalRequested(e) => e.account_id.clone(),
        }
    }

    pub fn payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Outbound notification sink. Publishing happens after the state it
/// describes is committed; a failed publish never rolls state back.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::debug!("Dropping event for {} (key {})", event.topic(), event.key());
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn topics(&self) -> Vec<&'static str> {
        self.events().iter().map(DomainEvent::topic).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_recording_publisher() {
        let publisher = RecordingPublisher::new();
        let order_id = Uuid::new_v4();
        let event = DomainEvent::OrderStatusChanged(OrderStatusChangedEvent {
            order_id,
            customer_id: "user-1".to_string(),
            from_status: "DRAFT".to_string(),
            to_status: "PENDING_PAYMENT".to_string(),
            timestamp: 0,
        });
        publisher.publish(&event).await.unwrap();

        assert_eq!(publisher.topics(), vec![TOPIC_ORDER_STATUS_CHANGED]);
        assert_eq!(event.key(), order_id.to_string());
        assert!(event.payload().unwrap().contains("PENDING_PAYMENT"));
    }
}
