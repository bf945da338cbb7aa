use camper_core::{
    Caller, ChannelError, ChargeOutcome, ChargeRequest, ChargeStatus, PaymentChannel,
};
use camper_shared::models::events::{
    OrderPaidEvent, ReconciliationRequiredEvent, RefundRequestedEvent,
};
use camper_shared::{Masked, Money};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::{status_changed, Context};
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::ledger::{stage_credit, stage_debit, Ledger};
use crate::locks::EntityGuard;
use crate::manager::{OrderEvent, OrderStateMachine};
use crate::models::{
    AttemptStatus, Order, PartChannel, PaymentAttempt, PaymentFailure, PaymentPart, TransactionKind,
};
use crate::repository::ChangeSet;
use crate::wallet::guard_payment_password;

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub parts: Vec<PaymentPart>,
    #[serde(default)]
    pub payment_password: Option<Masked<String>>,
}

/// Client-side confirmation after returning from the payment channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentConfirmation {
    #[serde(default)]
    pub external_transaction_id: Option<String>,
}

/// What the payment channel says happened to a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelOutcome {
    Charged { external_transaction_id: String },
    Declined { reason: String },
    Unknown { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResolution {
    pub order: Order,
    pub attempt: PaymentAttempt,
}

/// Settles orders across the wallet balance and a third-party channel.
/// The balance leg always settles before the channel is called.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    ctx: Context,
    ledger: Ledger,
    channel: Arc<dyn PaymentChannel>,
}

impl PaymentOrchestrator {
    pub(crate) fn new(ctx: Context, ledger: Ledger, channel: Arc<dyn PaymentChannel>) -> Self {
        Self { ctx, ledger, channel }
    }

    pub async fn attempt_payment(
        &self,
        caller: &Caller,
        order_id: Uuid,
        request: PaymentRequest,
    ) -> EngineResult<PaymentResolution> {
        let _order_guard = self.ctx.locks.order(order_id).await;
        let mut order = self.ctx.load_order(order_id).await?;
        if !caller.can_act_for(&order.customer_id) {
            return Err(EngineError::Forbidden(format!("order {} belongs to another customer", order_id)));
        }

        self.settle_open_attempts_locked(&mut order).await?;
        if !order.accepts_payment() {
            return Err(EngineError::StateConflict(format!(
                "order {} is {} and does not accept payment",
                order.id,
                order.status.as_str()
            )));
        }
        let parts = validate_parts(request.parts, order.outstanding())?;
        let mut attempt = PaymentAttempt::new(order.id, caller.account_id.clone(), parts);

        let balance_amount = attempt.balance_amount();
        if balance_amount.is_positive() {
            let _account_guard = self.ctx.locks.account(&attempt.account_id).await;
            let mut account = self.ledger.load_or_open(&attempt.account_id).await?;
            guard_payment_password(
                &self.ctx,
                &mut account,
                request.payment_password.as_ref().map(|p| p.expose().as_str()),
            )
            .await?;

            let mut changes = ChangeSet::default();
            match stage_debit(
                &mut changes,
                &mut account,
                balance_amount,
                TransactionKind::Payment,
                Some(order.id),
                Some(attempt.id),
            ) {
                Ok(tx) => {
                    attempt.balance_transaction_id = Some(tx.id);
                    changes.put_attempt(&attempt);
                    self.ctx.commit(changes).await?;
                    info!("Attempt {} debited {} from {}", attempt.id, balance_amount, attempt.account_id);
                }
                Err(err @ EngineError::InsufficientBalance { .. }) => {
                    attempt.fail(PartChannel::Balance, err.to_string());
                    let mut changes = ChangeSet::default();
                    changes.put_attempt(&attempt);
                    self.ctx.commit(changes).await?;
                    warn!("Attempt {} failed on balance leg: {}", attempt.id, err);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        } else {
            let mut changes = ChangeSet::default();
            changes.put_attempt(&attempt);
            self.ctx.commit(changes).await?;
        }

        if let Some(part) = attempt.third_party_part().cloned() {
            match self.charge(&attempt, &part).await {
                ChannelOutcome::Charged { external_transaction_id } => {
                    attempt.external_transaction_id = Some(external_transaction_id);
                }
                ChannelOutcome::Declined { reason } => {
                    self.compensate_locked(attempt, &reason).await?;
                    return Err(EngineError::ExternalChannel { reason, outcome_unknown: false });
                }
                ChannelOutcome::Unknown { reason } => {
                    self.mark_unresolved(attempt, &reason).await?;
                    return Err(EngineError::ExternalChannel { reason, outcome_unknown: true });
                }
            }
        }

        self.finalize_locked(order, attempt).await
    }

    /// Re-check the latest attempt for an order. Safe to call repeatedly.
    pub async fn confirm_payment(
        &self,
        caller: &Caller,
        order_id: Uuid,
        confirmation: PaymentConfirmation,
    ) -> EngineResult<PaymentResolution> {
        let _order_guard = self.ctx.locks.order(order_id).await;
        let order = self.ctx.load_order(order_id).await?;
        if !caller.can_act_for(&order.customer_id) {
            return Err(EngineError::Forbidden(format!("order {} belongs to another customer", order_id)));
        }

        let attempts = self.ctx.repo.list_attempts_for_order(order_id).await?;
        if let Some(done) = attempts.iter().rev().find(|a| a.status == AttemptStatus::Succeeded) {
            if let (Some(claimed), Some(recorded)) =
                (&confirmation.external_transaction_id, &done.external_transaction_id)
            {
                if claimed != recorded {
                    return Err(EngineError::StateConflict(format!(
                        "order {} was settled by transaction {}, not {}",
                        order_id, recorded, claimed
                    )));
                }
            }
            return Ok(PaymentResolution { order, attempt: done.clone() });
        }

        if let Some(open) = attempts.iter().rev().find(|a| a.status.is_open()) {
            return self.reconcile_locked(order, open.clone()).await;
        }

        match attempts.into_iter().last() {
            Some(last) => Ok(PaymentResolution { order, attempt: last }),
            None => Err(EngineError::not_found("Payment attempt for order", order_id)),
        }
    }

    /// Apply a channel notification to an attempt. Safe to repeat.
    pub async fn resolve_attempt(&self, attempt_id: Uuid, outcome: ChannelOutcome) -> EngineResult<PaymentResolution> {
        let order_id = self.ctx.load_attempt(attempt_id).await?.order_id;
        let _order_guard = self.ctx.locks.order(order_id).await;
        let order = self.ctx.load_order(order_id).await?;
        let attempt = self.ctx.load_attempt(attempt_id).await?;
        self.resolve_locked(order, attempt, outcome).await
    }

    /// Ask the channel about one open attempt and settle it accordingly.
    pub async fn reconcile_attempt(&self, attempt_id: Uuid) -> EngineResult<PaymentResolution> {
        let order_id = self.ctx.load_attempt(attempt_id).await?.order_id;
        let _order_guard = self.ctx.locks.order(order_id).await;
        let order = self.ctx.load_order(order_id).await?;
        let attempt = self.ctx.load_attempt(attempt_id).await?;
        if !attempt.status.is_open() {
            return Ok(PaymentResolution { order, attempt });
        }
        self.reconcile_locked(order, attempt).await
    }

    /// Settle every open attempt of an order before it is cancelled or
    /// rejected. Fails if one stays unresolved.
    pub async fn reconcile_order(&self, order_id: Uuid) -> EngineResult<Order> {
        let _order_guard = self.ctx.locks.order(order_id).await;
        let mut order = self.ctx.load_order(order_id).await?;
        self.settle_open_attempts_locked(&mut order).await?;
        Ok(order)
    }

    pub async fn attempts_for_order(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Vec<PaymentAttempt>> {
        let order = self.ctx.load_order(order_id).await?;
        if !caller.can_act_for(&order.customer_id) {
            return Err(EngineError::Forbidden(format!("order {} belongs to another customer", order_id)));
        }
        Ok(self.ctx.repo.list_attempts_for_order(order_id).await?)
    }

    async fn settle_open_attempts_locked(&self, order: &mut Order) -> EngineResult<()> {
        for attempt in self.ctx.open_attempts(order.id).await? {
            let resolution = self.reconcile_locked(order.clone(), attempt).await?;
            *order = resolution.order;
            if resolution.attempt.status.is_open() {
                return Err(EngineError::ReconciliationRequired(format!(
                    "attempt {} for order {} has an unknown third-party outcome",
                    resolution.attempt.id, order.id
                )));
            }
        }
        Ok(())
    }

    async fn reconcile_locked(&self, order: Order, attempt: PaymentAttempt) -> EngineResult<PaymentResolution> {
        if attempt.third_party_part().is_none() {
            // Balance-only: the debit is already committed with the attempt.
            return self.finalize_locked(order, attempt).await;
        }
        let outcome = self.query_charge(&attempt).await;
        self.resolve_locked(order, attempt, outcome).await
    }

    async fn resolve_locked(
        &self,
        order: Order,
        mut attempt: PaymentAttempt,
        outcome: ChannelOutcome,
    ) -> EngineResult<PaymentResolution> {
        match (attempt.status, outcome) {
            (AttemptStatus::Succeeded, ChannelOutcome::Charged { external_transaction_id }) => {
                match &attempt.external_transaction_id {
                    Some(recorded) if recorded != &external_transaction_id => {
                        let reason = format!(
                            "attempt {} settled as {} but channel reports {}",
                            attempt.id, recorded, external_transaction_id
                        );
                        self.escalate(&attempt, &reason).await;
                        Err(EngineError::ReconciliationRequired(reason))
                    }
                    _ => Ok(PaymentResolution { order, attempt }),
                }
            }
            (AttemptStatus::Succeeded, ChannelOutcome::Declined { reason }) => {
                let reason = format!("attempt {} already succeeded but channel reports decline: {}", attempt.id, reason);
                self.escalate(&attempt, &reason).await;
                Err(EngineError::ReconciliationRequired(reason))
            }
            (AttemptStatus::Succeeded, ChannelOutcome::Unknown { .. }) => Ok(PaymentResolution { order, attempt }),

            (AttemptStatus::Failed, ChannelOutcome::Charged { external_transaction_id }) => {
                let reason = format!(
                    "channel charged {} for attempt {} that was already failed and compensated",
                    external_transaction_id, attempt.id
                );
                self.escalate(&attempt, &reason).await;
                Err(EngineError::ReconciliationRequired(reason))
            }
            (AttemptStatus::Failed, _) => Ok(PaymentResolution { order, attempt }),

            (AttemptStatus::Pending | AttemptStatus::Unresolved, ChannelOutcome::Charged { external_transaction_id }) => {
                if attempt.third_party_part().is_some() {
                    attempt.external_transaction_id = Some(external_transaction_id);
                }
                self.finalize_locked(order, attempt).await
            }
            (AttemptStatus::Pending | AttemptStatus::Unresolved, ChannelOutcome::Declined { reason }) => {
                let attempt = self.compensate_locked(attempt, &reason).await?;
                Ok(PaymentResolution { order, attempt })
            }
            (AttemptStatus::Pending | AttemptStatus::Unresolved, ChannelOutcome::Unknown { reason }) => {
                let attempt = self.mark_unresolved(attempt, &reason).await?;
                self.escalate(&attempt, &reason).await;
                Ok(PaymentResolution { order, attempt })
            }
        }
    }

    /// All legs succeeded: mark the attempt, credit the order and advance it
    /// in one commit. If the order can no longer take the money, the attempt
    /// is reversed instead.
    async fn finalize_locked(&self, mut order: Order, mut attempt: PaymentAttempt) -> EngineResult<PaymentResolution> {
        if !order.accepts_payment() || attempt.total() != order.outstanding() {
            let reason = format!(
                "order {} is {} with {} outstanding; attempt {} for {} cannot settle it",
                order.id,
                order.status.as_str(),
                order.outstanding(),
                attempt.id,
                attempt.total()
            );
            let reversed = self.reverse_locked(attempt, &reason).await?;
            self.escalate(&reversed, &reason).await;
            return Err(EngineError::ReconciliationRequired(reason));
        }

        let needs_confirmation =
            order.order_type.requires_manual_confirmation() || !self.ctx.contract_cleared(&order).await?;
        order.amount_paid = order
            .amount_paid
            .checked_add(attempt.total())
            .ok_or_else(|| EngineError::Validation("paid amount overflow".to_string()))?;
        let from = OrderStateMachine::apply(&mut order, OrderEvent::PaymentSettled { needs_confirmation })?;
        attempt.failure = None;
        attempt.set_status(AttemptStatus::Succeeded);

        let mut changes = ChangeSet::default();
        changes.put_attempt(&attempt);
        changes.put_order(&order);
        self.ctx.commit(changes).await?;

        info!(
            "Order {} paid {} via attempt {}, now {}",
            order.id,
            attempt.total(),
            attempt.id,
            order.status.as_str()
        );
        let paid = DomainEvent::OrderPaid(OrderPaidEvent {
            order_id: order.id,
            attempt_id: attempt.id,
            customer_id: order.customer_id.to_string(),
            amount_paid: attempt.total(),
            balance_portion: attempt.balance_amount(),
            third_party_portion: attempt.third_party_amount(),
            external_transaction_id: attempt.external_transaction_id.clone(),
            timestamp: Utc::now().timestamp(),
        });
        self.ctx.publish(vec![paid, status_changed(&order, from)]).await;
        Ok(PaymentResolution { order, attempt })
    }

    /// Undo the balance leg of a failed attempt: REFUND credit and FAILED
    /// status in one commit. No-op for attempts already failed.
    async fn compensate_locked(&self, mut attempt: PaymentAttempt, reason: &str) -> EngineResult<PaymentAttempt> {
        if attempt.status == AttemptStatus::Failed {
            return Ok(attempt);
        }
        let mut changes = ChangeSet::default();
        let _account_guard = self.stage_compensation(&mut changes, &mut attempt).await?;
        attempt.fail(PartChannel::ThirdParty, reason);
        changes.put_attempt(&attempt);
        self.ctx.commit(changes).await?;

        warn!(
            "Attempt {} for order {} failed on third-party leg ({}); {} returned to {}",
            attempt.id,
            attempt.order_id,
            reason,
            attempt.balance_amount(),
            attempt.account_id
        );
        Ok(attempt)
    }

    /// Like compensation, but the channel did take its part: that part is
    /// handed to the refund flow.
    async fn reverse_locked(&self, mut attempt: PaymentAttempt, reason: &str) -> EngineResult<PaymentAttempt> {
        let mut changes = ChangeSet::default();
        let _account_guard = self.stage_compensation(&mut changes, &mut attempt).await?;
        attempt.fail(PartChannel::ThirdParty, reason);
        changes.put_attempt(&attempt);
        self.ctx.commit(changes).await?;

        if let (Some(part), Some(external_transaction_id)) =
            (attempt.third_party_part(), attempt.external_transaction_id.clone())
        {
            self.ctx
                .publish(vec![DomainEvent::RefundRequested(RefundRequestedEvent {
                    order_id: attempt.order_id,
                    attempt_id: attempt.id,
                    external_transaction_id,
                    amount: part.amount,
                    method: part.method.map(|m| m.as_str().to_string()).unwrap_or_default(),
                    timestamp: Utc::now().timestamp(),
                })])
                .await;
        }
        Ok(attempt)
    }

    async fn stage_compensation(
        &self,
        changes: &mut ChangeSet,
        attempt: &mut PaymentAttempt,
    ) -> EngineResult<Option<EntityGuard>> {
        if attempt.balance_transaction_id.is_none() || attempt.compensation_transaction_id.is_some() {
            return Ok(None);
        }
        let guard = self.ctx.locks.account(&attempt.account_id).await;
        let mut account = self.ledger.load_or_open(&attempt.account_id).await?;
        let tx = stage_credit(
            changes,
            &mut account,
            attempt.balance_amount(),
            TransactionKind::Refund,
            Some(attempt.order_id),
            Some(attempt.id),
        )?;
        attempt.compensation_transaction_id = Some(tx.id);
        Ok(Some(guard))
    }

    async fn mark_unresolved(&self, mut attempt: PaymentAttempt, reason: &str) -> EngineResult<PaymentAttempt> {
        attempt.failure = Some(PaymentFailure {
            leg: PartChannel::ThirdParty,
            reason: reason.to_string(),
        });
        attempt.set_status(AttemptStatus::Unresolved);
        let mut changes = ChangeSet::default();
        changes.put_attempt(&attempt);
        self.ctx.commit(changes).await?;
        warn!("Attempt {} for order {} is unresolved: {}", attempt.id, attempt.order_id, reason);
        Ok(attempt)
    }

    async fn escalate(&self, attempt: &PaymentAttempt, reason: &str) {
        error!("Reconciliation required for attempt {}: {}", attempt.id, reason);
        self.ctx
            .publish(vec![DomainEvent::ReconciliationRequired(ReconciliationRequiredEvent {
                order_id: Some(attempt.order_id),
                attempt_id: Some(attempt.id),
                account_id: Some(attempt.account_id.to_string()),
                reason: reason.to_string(),
                timestamp: Utc::now().timestamp(),
            })])
            .await;
    }

    async fn charge(&self, attempt: &PaymentAttempt, part: &PaymentPart) -> ChannelOutcome {
        let Some(method) = part.method else {
            return ChannelOutcome::Declined { reason: "third-party part has no method".to_string() };
        };
        let request = ChargeRequest {
            reference: attempt.id.to_string(),
            account_id: attempt.account_id.clone(),
            amount: part.amount,
            method,
            description: format!("order {}", attempt.order_id),
        };
        charge_channel(self.channel.as_ref(), &request, self.ctx.config.channel_timeout).await
    }

    async fn query_charge(&self, attempt: &PaymentAttempt) -> ChannelOutcome {
        query_channel(self.channel.as_ref(), &attempt.id.to_string(), self.ctx.config.channel_timeout).await
    }
}

/// One bounded charge call. Timeouts and transport errors are `Unknown`,
/// never a decline.
pub(crate) async fn charge_channel(
    channel: &dyn PaymentChannel,
    request: &ChargeRequest,
    timeout: Duration,
) -> ChannelOutcome {
    match tokio::time::timeout(timeout, channel.charge(request)).await {
        Ok(Ok(ChargeOutcome::Succeeded { external_transaction_id })) => {
            ChannelOutcome::Charged { external_transaction_id }
        }
        Ok(Ok(ChargeOutcome::Failed { reason })) => ChannelOutcome::Declined { reason },
        Ok(Err(ChannelError::Rejected(reason))) => ChannelOutcome::Declined { reason },
        Ok(Err(ChannelError::Transport(reason))) => ChannelOutcome::Unknown { reason },
        Err(_) => ChannelOutcome::Unknown {
            reason: format!("charge timed out after {}ms", timeout.as_millis()),
        },
    }
}

/// Look a charge up by reference. A charge the channel never saw counts as
/// declined.
pub(crate) async fn query_channel(channel: &dyn PaymentChannel, reference: &str, timeout: Duration) -> ChannelOutcome {
    match tokio::time::timeout(timeout, channel.charge_status(reference)).await {
        Ok(Ok(ChargeStatus::Succeeded { external_transaction_id })) => {
            ChannelOutcome::Charged { external_transaction_id }
        }
        Ok(Ok(ChargeStatus::Failed { reason })) => ChannelOutcome::Declined { reason },
        Ok(Ok(ChargeStatus::NotFound)) => ChannelOutcome::Declined {
            reason: "channel has no record of the charge".to_string(),
        },
        Ok(Ok(ChargeStatus::Pending)) => ChannelOutcome::Unknown {
            reason: "channel reports the charge as pending".to_string(),
        },
        Ok(Err(e)) => ChannelOutcome::Unknown { reason: e.to_string() },
        Err(_) => ChannelOutcome::Unknown {
            reason: format!("status query timed out after {}ms", timeout.as_millis()),
        },
    }
}

/// Check the parts of a payment request and put the balance part first.
fn validate_parts(parts: Vec<PaymentPart>, expected: Money) -> EngineResult<Vec<PaymentPart>> {
    if parts.is_empty() {
        return Err(EngineError::Validation("payment needs at least one part".to_string()));
    }
    let mut seen = HashSet::new();
    for part in &parts {
        if !part.amount.is_positive() {
            return Err(EngineError::InvalidAmount(part.amount));
        }
        if !seen.insert(part.channel) {
            return Err(EngineError::Validation(format!("more than one {:?} part", part.channel)));
        }
        if part.channel == PartChannel::ThirdParty && part.method.is_none() {
            return Err(EngineError::Validation("third-party part must name a method".to_string()));
        }
    }
    let actual = Money::checked_sum(parts.iter().map(|p| p.amount))
        .ok_or_else(|| EngineError::Validation("payment total overflow".to_string()))?;
    if actual != expected {
        return Err(EngineError::AmountMismatch { expected, actual });
    }

    let mut parts = parts;
    parts.sort_by_key(|p| match p.channel {
        PartChannel::Balance => 0,
        PartChannel::ThirdParty => 1,
    });
    Ok(parts)
}
