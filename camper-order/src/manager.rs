use camper_catalog::{LineItem, PriceQuote, PricingCalculator, PricingInput};
use camper_core::{AccountId, Caller};
use camper_shared::models::events::RefundRequestedEvent;
use camper_shared::Money;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::{status_changed, Context};
use crate::contract::ContractTemplates;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::ledger::{stage_credit, Ledger};
use crate::locks::EntityGuard;
use crate::models::{
    Account, AttemptStatus, ContactInfo, ContractStatus, Order, OrderStatus, OrderType, PartChannel,
    TransactionKind,
};
use crate::repository::{ChangeSet, OrderFilter};

/// Inputs to the order state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    Submit { amount_due: Money, needs_confirmation: bool },
    PaymentSettled { needs_confirmation: bool },
    Confirm { contract_cleared: bool },
    Reject { paid: bool },
    Complete,
    Cancel { paid: bool },
    RefundSettled,
}

impl OrderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrderEvent::Submit { .. } => "submit",
            OrderEvent::PaymentSettled { .. } => "settle payment for",
            OrderEvent::Confirm { .. } => "confirm",
            OrderEvent::Reject { .. } => "reject",
            OrderEvent::Complete => "complete",
            OrderEvent::Cancel { .. } => "cancel",
            OrderEvent::RefundSettled => "settle refund for",
        }
    }
}

impl OrderStatus {
    /// The transition table. `None` means the event is not allowed here.
    pub fn next(self, event: &OrderEvent) -> Option<OrderStatus> {
        use OrderEvent as E;
        use OrderStatus as S;

        match (self, *event) {
            (S::Draft, E::Submit { amount_due, needs_confirmation }) => Some(if amount_due.is_positive() {
                S::PendingPayment
            } else if needs_confirmation {
                S::PendingConfirmation
            } else {
                S::InProgress
            }),

            (S::PendingPayment, E::PaymentSettled { needs_confirmation: true }) => Some(S::PendingConfirmation),
            (S::PendingPayment, E::PaymentSettled { needs_confirmation: false }) => Some(S::InProgress),

            (S::PendingConfirmation, E::Confirm { contract_cleared: true }) => Some(S::InProgress),
            (S::PendingConfirmation, E::Reject { paid: true }) => Some(S::PendingRefund),
            (S::PendingConfirmation, E::Reject { paid: false }) => Some(S::Cancelled),

            (S::InProgress, E::Complete) => Some(S::Completed),

            (S::Draft | S::PendingPayment, E::Cancel { paid: false }) => Some(S::Cancelled),
            (S::PendingConfirmation | S::InProgress, E::Cancel { paid: true }) => Some(S::PendingRefund),
            (S::PendingConfirmation | S::InProgress, E::Cancel { paid: false }) => Some(S::Cancelled),

            (S::PendingRefund, E::RefundSettled) => Some(S::Refunded),

            _ => None,
        }
    }
}

pub struct OrderStateMachine;

impl OrderStateMachine {
    /// Apply `event` to the order, returning the status it left.
    pub fn apply(order: &mut Order, event: OrderEvent) -> EngineResult<OrderStatus> {
        let from = order.status;
        let to = from.next(&event).ok_or_else(|| {
            EngineError::StateConflict(format!(
                "cannot {} order {} in status {}",
                event.name(),
                order.id,
                from.as_str()
            ))
        })?;
        order.update_status(to);
        Ok(from)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub order_type: OrderType,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub coupon_ids: BTreeSet<String>,
    #[serde(default)]
    pub insurance_id: Option<String>,
    #[serde(default)]
    pub contact: Option<ContactInfo>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CreateOrderRequest {
    pub fn pricing_input(&self) -> PricingInput {
        PricingInput {
            items: self.items.clone(),
            coupon_ids: self.coupon_ids.clone(),
            insurance_id: self.insurance_id.clone(),
        }
    }
}

/// Order creation and every order transition outside of payment.
#[derive(Clone)]
pub struct OrderManager {
    ctx: Context,
    calculator: Arc<PricingCalculator>,
    templates: ContractTemplates,
    ledger: Ledger,
}

impl OrderManager {
    pub(crate) fn new(ctx: Context, calculator: Arc<PricingCalculator>, ledger: Ledger) -> Self {
        Self {
            ctx,
            calculator,
            templates: ContractTemplates,
            ledger,
        }
    }

    pub fn calculate_price(&self, input: &PricingInput) -> EngineResult<PriceQuote> {
        Ok(self.calculator.calculate(input)?)
    }

    /// Price and submit a new order for the caller. Orders of types that need
    /// a contract get it generated in the same commit.
    pub async fn create_order(&self, caller: &Caller, request: CreateOrderRequest) -> EngineResult<Order> {
        let quote = self.calculate_price(&request.pricing_input())?;
        let now = Utc::now();
        let metadata = if request.metadata.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            request.metadata
        };

        let mut order = Order {
            id: Uuid::new_v4(),
            customer_id: caller.account_id.clone(),
            order_type: request.order_type,
            status: OrderStatus::Draft,
            items: request.items,
            applied_coupons: quote.applied_coupons,
            insurance_id: request.insurance_id,
            subtotal: quote.subtotal,
            discount: quote.discount,
            insurance_fee: quote.insurance_fee,
            amount_due: quote.amount_due,
            amount_paid: Money::ZERO,
            amount_refunded: Money::ZERO,
            contract_id: None,
            contact: request.contact,
            metadata,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        let mut changes = ChangeSet::default();
        if order.order_type.requires_contract() {
            let contract = self.templates.render(&order, now)?;
            order.contract_id = Some(contract.id);
            changes.put_contract(&contract);
        }

        let submit = OrderEvent::Submit {
            amount_due: order.amount_due,
            needs_confirmation: order.order_type.requires_manual_confirmation() || order.contract_id.is_some(),
        };
        let from = OrderStateMachine::apply(&mut order, submit)?;
        changes.put_order(&order);
        self.ctx.commit(changes).await?;

        info!(
            "Created {} order {} for {}: {} due, status {}",
            order.order_type.as_str(),
            order.id,
            order.customer_id,
            order.amount_due,
            order.status.as_str()
        );
        self.ctx.publish(vec![status_changed(&order, from)]).await;
        Ok(order)
    }

    pub async fn get_order(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Order> {
        let order = self.ctx.load_order(order_id).await?;
        ensure_owner(caller, &order)?;
        Ok(order)
    }

    /// Customers only ever see their own orders.
    pub async fn list_orders(&self, caller: &Caller, mut filter: OrderFilter) -> EngineResult<Vec<Order>> {
        if !caller.is_operator() {
            filter.customer_id = Some(caller.account_id.clone());
        }
        Ok(self.ctx.repo.list_orders(&filter).await?)
    }

    pub async fn confirm_order(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Order> {
        ensure_operator(caller)?;
        let _guard = self.ctx.locks.order(order_id).await;
        let mut order = self.ctx.load_order(order_id).await?;
        if matches!(order.status, OrderStatus::InProgress | OrderStatus::Completed) {
            return Ok(order);
        }
        let contract_cleared = self.ctx.contract_cleared(&order).await?;
        if order.status == OrderStatus::PendingConfirmation && !contract_cleared {
            return Err(EngineError::StateConflict(format!(
                "order {} cannot be confirmed before its contract is signed and verified",
                order.id
            )));
        }
        let from = OrderStateMachine::apply(&mut order, OrderEvent::Confirm { contract_cleared })?;

        let mut changes = ChangeSet::default();
        changes.put_order(&order);
        self.ctx.commit(changes).await?;
        info!("Order {} confirmed by {}", order.id, caller.account_id);
        self.ctx.publish(vec![status_changed(&order, from)]).await;
        Ok(order)
    }

    /// Merchant declines the booking. Paid orders are refunded.
    pub async fn reject_order(&self, caller: &Caller, order_id: Uuid, reason: Option<String>) -> EngineResult<Order> {
        ensure_operator(caller)?;
        let _guard = self.ctx.locks.order(order_id).await;
        let mut order = self.ctx.load_order(order_id).await?;
        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
            return Ok(order);
        }
        if order.status == OrderStatus::PendingRefund {
            return self.settle_refund_locked(order).await;
        }
        self.ensure_settled(&order).await?;

        let reject = OrderEvent::Reject { paid: order.is_paid() };
        let from = OrderStateMachine::apply(&mut order, reject)?;
        order.cancellation_reason = reason;
        self.close_out(order, from).await
    }

    pub async fn complete_order(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Order> {
        ensure_operator(caller)?;
        let _guard = self.ctx.locks.order(order_id).await;
        let mut order = self.ctx.load_order(order_id).await?;
        if order.status == OrderStatus::Completed {
            return Ok(order);
        }
        let from = OrderStateMachine::apply(&mut order, OrderEvent::Complete)?;

        let mut changes = ChangeSet::default();
        let _contract_guard = match order.contract_id {
            Some(contract_id) => {
                let guard = self.ctx.locks.contract(contract_id).await;
                let mut contract = self.ctx.load_contract(contract_id).await?;
                if contract.status.is_signed() {
                    contract.set_status(ContractStatus::Completed);
                    changes.put_contract(&contract);
                }
                Some(guard)
            }
            None => None,
        };
        changes.put_order(&order);
        self.ctx.commit(changes).await?;

        info!("Order {} completed", order.id);
        self.ctx.publish(vec![status_changed(&order, from)]).await;
        Ok(order)
    }

    /// Cancel by the customer or an operator. Unpaid orders are cancelled
    /// outright; paid ones go through PENDING_REFUND to REFUNDED.
    pub async fn cancel_order(&self, caller: &Caller, order_id: Uuid, reason: Option<String>) -> EngineResult<Order> {
        let _guard = self.ctx.locks.order(order_id).await;
        let mut order = self.ctx.load_order(order_id).await?;
        ensure_owner(caller, &order)?;
        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
            return Ok(order);
        }
        if order.status == OrderStatus::PendingRefund {
            return self.settle_refund_locked(order).await;
        }
        self.ensure_settled(&order).await?;

        let cancel = OrderEvent::Cancel { paid: order.is_paid() };
        let from = OrderStateMachine::apply(&mut order, cancel)?;
        order.cancellation_reason = reason;
        self.close_out(order, from).await
    }

    /// Finish an order stuck in PENDING_REFUND.
    pub async fn settle_refund(&self, order_id: Uuid) -> EngineResult<Order> {
        let _guard = self.ctx.locks.order(order_id).await;
        let order = self.ctx.load_order(order_id).await?;
        self.settle_refund_locked(order).await
    }

    /// Commit a cancellation or rejection, closing the contract with it, and
    /// run the refund when money was taken.
    async fn close_out(&self, order: Order, from: OrderStatus) -> EngineResult<Order> {
        let mut changes = ChangeSet::default();
        let _contract_guard = match order.contract_id {
            Some(contract_id) => {
                let guard = self.ctx.locks.contract(contract_id).await;
                let mut contract = self.ctx.load_contract(contract_id).await?;
                if contract.status.is_signed() {
                    contract.set_status(ContractStatus::Terminated);
                    changes.put_contract(&contract);
                } else if !contract.status.is_closed() {
                    contract.set_status(ContractStatus::Cancelled);
                    changes.put_contract(&contract);
                }
                Some(guard)
            }
            None => None,
        };
        changes.put_order(&order);
        self.ctx.commit(changes).await?;

        info!("Order {} moved from {} to {}", order.id, from.as_str(), order.status.as_str());
        self.ctx.publish(vec![status_changed(&order, from)]).await;

        if order.status == OrderStatus::PendingRefund {
            self.settle_refund_locked(order).await
        } else {
            Ok(order)
        }
    }

    /// Credit back the balance-funded portion and request refunds of the
    /// channel-funded portion. Caller holds the order lock.
    async fn settle_refund_locked(&self, mut order: Order) -> EngineResult<Order> {
        if order.status == OrderStatus::Refunded {
            return Ok(order);
        }
        if order.status != OrderStatus::PendingRefund {
            return Err(EngineError::StateConflict(format!(
                "order {} is {}, not awaiting a refund",
                order.id,
                order.status.as_str()
            )));
        }

        let attempts = self.ctx.repo.list_attempts_for_order(order.id).await?;
        let settled: Vec<_> = attempts.into_iter().filter(|a| a.status == AttemptStatus::Succeeded).collect();

        let mut changes = ChangeSet::default();
        let mut events = Vec::new();
        let mut accounts: HashMap<AccountId, (EntityGuard, Account)> = HashMap::new();
        let now = Utc::now().timestamp();

        for attempt in &settled {
            let balance_portion = attempt.balance_amount();
            if balance_portion.is_positive() {
                if !accounts.contains_key(&attempt.account_id) {
                    let guard = self.ctx.locks.account(&attempt.account_id).await;
                    let account = self.ledger.load_or_open(&attempt.account_id).await?;
                    accounts.insert(attempt.account_id.clone(), (guard, account));
                }
                if let Some((_, account)) = accounts.get_mut(&attempt.account_id) {
                    stage_credit(
                        &mut changes,
                        account,
                        balance_portion,
                        TransactionKind::Refund,
                        Some(order.id),
                        Some(attempt.id),
                    )?;
                }
            }

            for part in attempt.parts.iter().filter(|p| p.channel == PartChannel::ThirdParty) {
                let Some(external_transaction_id) = attempt.external_transaction_id.clone() else {
                    warn!("Settled attempt {} has no external transaction id", attempt.id);
                    continue;
                };
                events.push(DomainEvent::RefundRequested(RefundRequestedEvent {
                    order_id: order.id,
                    attempt_id: attempt.id,
                    external_transaction_id,
                    amount: part.amount,
                    method: part.method.map(|m| m.as_str().to_string()).unwrap_or_default(),
                    timestamp: now,
                }));
            }
        }

        order.amount_refunded = order.amount_paid;
        let from = OrderStateMachine::apply(&mut order, OrderEvent::RefundSettled)?;
        changes.put_order(&order);
        self.ctx.commit(changes).await?;
        drop(accounts);

        info!("Order {} refunded {}", order.id, order.amount_refunded);
        events.push(status_changed(&order, from));
        self.ctx.publish(events).await;
        Ok(order)
    }

    async fn ensure_settled(&self, order: &Order) -> EngineResult<()> {
        if let Some(open) = self.ctx.open_attempts(order.id).await?.first() {
            return Err(EngineError::ReconciliationRequired(format!(
                "payment attempt {} for order {} is not settled",
                open.id, order.id
            )));
        }
        Ok(())
    }
}

fn ensure_owner(caller: &Caller, order: &Order) -> EngineResult<()> {
    if caller.can_act_for(&order.customer_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!("order {} belongs to another customer", order.id)))
    }
}

fn ensure_operator(caller: &Caller) -> EngineResult<()> {
    if caller.is_operator() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("operator role required".to_string()))
    }
}
