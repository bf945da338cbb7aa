use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::Context;
use crate::manager::OrderManager;
use crate::models::{AttemptStatus, OrderStatus, RechargeStatus};
use crate::orchestrator::PaymentOrchestrator;
use crate::repository::OrderFilter;
use crate::wallet::WalletService;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Attempts that turned out to have succeeded and were applied.
    pub resolved: Vec<Uuid>,
    /// Attempts that failed and had their balance leg returned.
    pub compensated: Vec<Uuid>,
    /// Attempts whose outcome is still unknown.
    pub unresolved: Vec<Uuid>,
    /// Wallet recharges the channel confirmed and that were credited.
    pub recharges_credited: Vec<Uuid>,
    /// Wallet recharges the channel declined or never saw.
    pub recharges_failed: Vec<Uuid>,
    /// Wallet recharges whose outcome is still unknown.
    pub recharges_unresolved: Vec<Uuid>,
    /// Orders moved from PENDING_REFUND to REFUNDED.
    pub refunds_settled: Vec<Uuid>,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty() && self.recharges_unresolved.is_empty() && self.errors.is_empty()
    }
}

/// Sweeps payment attempts, wallet recharges and refunds left half-done by timeouts or a
/// crash. Run at start-up and on an interval.
#[derive(Clone)]
pub struct RecoveryPass {
    ctx: Context,
    payments: PaymentOrchestrator,
    orders: OrderManager,
    wallet: WalletService,
}

impl RecoveryPass {
    pub(crate) fn new(
        ctx: Context,
        payments: PaymentOrchestrator,
        orders: OrderManager,
        wallet: WalletService,
    ) -> Self {
        Self { ctx, payments, orders, wallet }
    }

    pub async fn run(&self) -> RecoveryReport {
        self.run_at(Utc::now()).await
    }

    /// PENDING attempts and recharges younger than the stale threshold are
    /// left alone; they may still be in flight elsewhere.
    pub async fn run_at(&self, now: DateTime<Utc>) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        match self.ctx.repo.list_open_attempts().await {
            Ok(attempts) => {
                for attempt in attempts {
                    let stale = now - attempt.updated_at >= self.ctx.config.stale_attempt_after;
                    if attempt.status == AttemptStatus::Pending && !stale {
                        continue;
                    }
                    match self.payments.reconcile_attempt(attempt.id).await {
                        Ok(resolution) => match resolution.attempt.status {
                            AttemptStatus::Succeeded => report.resolved.push(attempt.id),
                            AttemptStatus::Failed => report.compensated.push(attempt.id),
                            AttemptStatus::Pending | AttemptStatus::Unresolved => {
                                report.unresolved.push(attempt.id)
                            }
                        },
                        Err(e) => {
                            error!("Recovery of attempt {} failed: {}", attempt.id, e);
                            report.errors.push(format!("attempt {}: {}", attempt.id, e));
                        }
                    }
                }
            }
            Err(e) => {
                error!("Recovery could not list open attempts: {}", e);
                report.errors.push(format!("list open attempts: {}", e));
            }
        }

        match self.ctx.repo.list_open_recharges().await {
            Ok(recharges) => {
                for intent in recharges {
                    let stale = now - intent.updated_at >= self.ctx.config.stale_attempt_after;
                    if intent.status == RechargeStatus::Pending && !stale {
                        continue;
                    }
                    match self.wallet.reconcile_recharge(intent.id).await {
                        Ok(settlement) => match settlement.intent.status {
                            RechargeStatus::Succeeded => report.recharges_credited.push(intent.id),
                            RechargeStatus::Failed => report.recharges_failed.push(intent.id),
                            RechargeStatus::Pending | RechargeStatus::Unresolved => {
                                report.recharges_unresolved.push(intent.id)
                            }
                        },
                        Err(e) => {
                            error!("Recovery of recharge {} failed: {}", intent.id, e);
                            report.errors.push(format!("recharge {}: {}", intent.id, e));
                        }
                    }
                }
            }
            Err(e) => {
                error!("Recovery could not list open recharges: {}", e);
                report.errors.push(format!("list open recharges: {}", e));
            }
        }

        let stuck = OrderFilter {
            status: Some(OrderStatus::PendingRefund),
            ..OrderFilter::default()
        };
        match self.ctx.repo.list_orders(&stuck).await {
            Ok(orders) => {
                for order in orders {
                    match self.orders.settle_refund(order.id).await {
                        Ok(_) => report.refunds_settled.push(order.id),
                        Err(e) => {
                            error!("Refund settlement for order {} failed: {}", order.id, e);
                            report.errors.push(format!("order {}: {}", order.id, e));
                        }
                    }
                }
            }
            Err(e) => {
                error!("Recovery could not list refunding orders: {}", e);
                report.errors.push(format!("list refunding orders: {}", e));
            }
        }

        info!(
            "Recovery pass: {} resolved, {} compensated, {} unresolved, {} recharges credited, \
             {} recharges failed, {} recharges unresolved, {} refunds settled, {} errors",
            report.resolved.len(),
            report.compensated.len(),
            report.unresolved.len(),
            report.recharges_credited.len(),
            report.recharges_failed.len(),
            report.recharges_unresolved.len(),
            report.refunds_settled.len(),
            report.errors.len()
        );
        report
    }
}
