use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{DomainEvent, EventPublisher};
use crate::locks::KeyedLocks;
use crate::models::{Contract, ContractStatus, Order, OrderStatus, PaymentAttempt};
use crate::repository::{ChangeSet, EngineRepository};
use camper_shared::models::events::OrderStatusChangedEvent;

/// Shared handles every engine service works through.
#[derive(Clone)]
pub(crate) struct Context {
    pub repo: Arc<dyn EngineRepository>,
    pub locks: Arc<KeyedLocks>,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<EngineConfig>,
}

impl Context {
    pub async fn load_order(&self, id: Uuid) -> EngineResult<Order> {
        self.repo.get_order(id).await?.ok_or_else(|| EngineError::not_found("Order", id))
    }

    pub async fn load_contract(&self, id: Uuid) -> EngineResult<Contract> {
        self.repo.get_contract(id).await?.ok_or_else(|| EngineError::not_found("Contract", id))
    }

    pub async fn load_attempt(&self, id: Uuid) -> EngineResult<PaymentAttempt> {
        self.repo
            .get_attempt(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Payment attempt", id))
    }

    pub async fn commit(&self, changes: ChangeSet) -> EngineResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.repo.commit(changes).await.map_err(|e| {
            tracing::error!("Commit failed: {}", e);
            EngineError::Repository(e)
        })
    }

    pub async fn publish(&self, events: Vec<DomainEvent>) {
        for event in events {
            if let Err(e) = self.events.publish(&event).await {
                tracing::warn!("Failed to publish {} event {}: {}", event.topic(), event.key(), e);
            }
        }
    }

    /// Whether the order's contract (if any) is far enough along for the
    /// order to be confirmed.
    pub async fn contract_cleared(&self, order: &Order) -> EngineResult<bool> {
        let Some(contract_id) = order.contract_id else {
            return Ok(true);
        };
        let contract = self.load_contract(contract_id).await?;
        Ok(match contract.status {
            ContractStatus::Verified | ContractStatus::Completed => true,
            ContractStatus::Signed => self.config.accept_signed_contracts,
            _ => false,
        })
    }

    pub async fn open_attempts(&self, order_id: Uuid) -> EngineResult<Vec<PaymentAttempt>> {
        let attempts = self.repo.list_attempts_for_order(order_id).await?;
        Ok(attempts.into_iter().filter(|a| a.status.is_open()).collect())
    }
}

pub(crate) fn status_changed(order: &Order, from: OrderStatus) -> DomainEvent {
    DomainEvent::OrderStatusChanged(OrderStatusChangedEvent {
        order_id: order.id,
        customer_id: order.customer_id.to_string(),
        from_status: from.as_str().to_string(),
        to_status: order.status.as_str().to_string(),
        timestamp: Utc::now().timestamp(),
    })
}
