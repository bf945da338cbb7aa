use camper_core::{AccountId, Caller, ChargeRequest, PaymentChannel, ThirdPartyMethod};
use camper_shared::models::events::{ReconciliationRequiredEvent, WithdrawalRequestedEvent};
use camper_shared::Money;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::ledger::{stage_credit, stage_debit, Ledger};
use crate::models::{Account, LedgerTransaction, RechargeIntent, RechargeStatus, TransactionKind};
use crate::orchestrator::{charge_channel, query_channel, ChannelOutcome};
use crate::repository::{ChangeSet, TransactionFilter};

const PASSWORD_SALT: &str = "camper-wallet";
const PASSWORD_LEN: usize = 6;
/// Wrong passwords in a row before the password is locked.
pub const MAX_PASSWORD_FAILURES: u32 = 5;
const PASSWORD_LOCKOUT_MINUTES: i64 = 15;

#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub account_id: AccountId,
    pub balance: Money,
    pub has_payment_password: bool,
    pub active: bool,
}

/// A recharge intent and, once credited, its ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct RechargeSettlement {
    pub intent: RechargeIntent,
    pub transaction: Option<LedgerTransaction>,
}

pub(crate) fn hash_payment_password(account_id: &AccountId, password: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", PASSWORD_SALT, account_id, password).as_bytes());
    hex::encode(digest)
}

/// Accounts without a payment password pay from balance freely. A wrong
/// password bumps the failure counter on `account`; enough of them in a row
/// lock the password for a while.
pub(crate) fn check_payment_password(
    account: &mut Account,
    supplied: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let Some(expected) = account.payment_password_hash.clone() else {
        return Ok(());
    };
    if let Some(until) = account.password_locked_until.filter(|until| *until > now) {
        return Err(EngineError::PaymentPasswordLocked { until });
    }
    let supplied = supplied.ok_or(EngineError::PaymentPasswordRequired)?;
    if hash_payment_password(&account.id, supplied) == expected {
        account.failed_password_attempts = 0;
        account.password_locked_until = None;
        return Ok(());
    }

    account.failed_password_attempts += 1;
    if account.failed_password_attempts >= MAX_PASSWORD_FAILURES {
        account.failed_password_attempts = 0;
        account.password_locked_until = Some(now + chrono::Duration::minutes(PASSWORD_LOCKOUT_MINUTES));
    }
    account.updated_at = now;
    Err(EngineError::InvalidPaymentPassword)
}

/// `check_payment_password` plus persisting the failure counter. Callers
/// hold the account lock.
pub(crate) async fn guard_payment_password(
    ctx: &Context,
    account: &mut Account,
    supplied: Option<&str>,
) -> EngineResult<()> {
    let had_failures = account.failed_password_attempts > 0 || account.password_locked_until.is_some();
    match check_payment_password(account, supplied, Utc::now()) {
        Ok(()) => {
            if had_failures {
                let mut changes = ChangeSet::default();
                changes.put_account(account);
                ctx.commit(changes).await?;
            }
            Ok(())
        }
        Err(EngineError::InvalidPaymentPassword) => {
            let mut changes = ChangeSet::default();
            changes.put_account(account);
            ctx.commit(changes).await?;
            if let Some(until) = account.password_locked_until {
                warn!("Payment password for {} locked until {}", account.id, until);
            }
            Err(EngineError::InvalidPaymentPassword)
        }
        Err(e) => Err(e),
    }
}

fn validate_password_format(password: &str) -> EngineResult<()> {
    if password.len() == PASSWORD_LEN && password.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!("payment password must be {} digits", PASSWORD_LEN)))
    }
}

/// The caller's own wallet: balance, history, top-ups and withdrawals.
#[derive(Clone)]
pub struct WalletService {
    ctx: Context,
    ledger: Ledger,
    channel: Arc<dyn PaymentChannel>,
}

impl WalletService {
    pub(crate) fn new(ctx: Context, ledger: Ledger, channel: Arc<dyn PaymentChannel>) -> Self {
        Self { ctx, ledger, channel }
    }

    pub async fn summary(&self, caller: &Caller) -> EngineResult<WalletSummary> {
        let account = self
            .ctx
            .repo
            .get_account(&caller.account_id)
            .await?
            .unwrap_or_else(|| Account::open(caller.account_id.clone()));
        Ok(WalletSummary {
            account_id: account.id.clone(),
            balance: account.balance,
            has_payment_password: account.has_payment_password(),
            active: account.active,
        })
    }

    pub async fn transactions(
        &self,
        caller: &Caller,
        filter: &TransactionFilter,
    ) -> EngineResult<Vec<LedgerTransaction>> {
        self.ledger.transactions(&caller.account_id, filter).await
    }

    /// Record the intent, charge the channel, then credit the balance.
    /// Nothing is credited unless the channel confirms the charge; an
    /// unanswered charge stays UNRESOLVED for the recovery pass.
    pub async fn recharge(
        &self,
        caller: &Caller,
        amount: Money,
        method: ThirdPartyMethod,
    ) -> EngineResult<LedgerTransaction> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount(amount));
        }
        let intent = RechargeIntent::new(caller.account_id.clone(), amount, method);
        let mut changes = ChangeSet::default();
        changes.put_recharge(&intent);
        self.ctx.commit(changes).await?;

        let request = ChargeRequest {
            reference: intent.reference(),
            account_id: intent.account_id.clone(),
            amount,
            method,
            description: "wallet recharge".to_string(),
        };
        let outcome = charge_channel(self.channel.as_ref(), &request, self.ctx.config.channel_timeout).await;
        let settlement = self.settle_recharge(intent.id, outcome).await?;

        match (settlement.intent.status, settlement.transaction) {
            (RechargeStatus::Succeeded, Some(tx)) => Ok(tx),
            (RechargeStatus::Failed, _) => Err(EngineError::ExternalChannel {
                reason: settlement.intent.failure_reason.unwrap_or_default(),
                outcome_unknown: false,
            }),
            (RechargeStatus::Pending | RechargeStatus::Unresolved, _) => Err(EngineError::ExternalChannel {
                reason: settlement.intent.failure_reason.unwrap_or_default(),
                outcome_unknown: true,
            }),
            (RechargeStatus::Succeeded, None) => Err(EngineError::ReconciliationRequired(format!(
                "recharge {} succeeded without a ledger entry",
                settlement.intent.id
            ))),
        }
    }

    /// Ask the channel about an open recharge and apply the answer. Closed
    /// recharges are returned unchanged.
    pub async fn reconcile_recharge(&self, recharge_id: Uuid) -> EngineResult<RechargeSettlement> {
        let intent = self.load_recharge(recharge_id).await?;
        if !intent.status.is_open() {
            return Ok(RechargeSettlement { intent, transaction: None });
        }
        let outcome =
            query_channel(self.channel.as_ref(), &intent.reference(), self.ctx.config.channel_timeout).await;
        self.settle_recharge(recharge_id, outcome).await
    }

    /// Apply a channel outcome to a recharge. RECHARGE is credited at most
    /// once per intent.
    async fn settle_recharge(&self, recharge_id: Uuid, outcome: ChannelOutcome) -> EngineResult<RechargeSettlement> {
        let account_id = self.load_recharge(recharge_id).await?.account_id;
        let _guard = self.ctx.locks.account(&account_id).await;
        let mut intent = self.load_recharge(recharge_id).await?;

        match (intent.status, outcome) {
            (RechargeStatus::Pending | RechargeStatus::Unresolved, ChannelOutcome::Charged { external_transaction_id }) => {
                let mut account = self.ledger.load_or_open(&intent.account_id).await?;
                let mut changes = ChangeSet::default();
                let tx = stage_credit(&mut changes, &mut account, intent.amount, TransactionKind::Recharge, None, None)?;
                intent.external_transaction_id = Some(external_transaction_id);
                intent.ledger_transaction_id = Some(tx.id);
                intent.failure_reason = None;
                intent.set_status(RechargeStatus::Succeeded);
                changes.put_recharge(&intent);
                self.ctx.commit(changes).await?;
                info!(
                    "Recharge {} credited {} to {}, balance {}",
                    intent.id, intent.amount, intent.account_id, tx.balance_after
                );
                Ok(RechargeSettlement { intent, transaction: Some(tx) })
            }
            (RechargeStatus::Pending | RechargeStatus::Unresolved, ChannelOutcome::Declined { reason }) => {
                warn!("Recharge {} for {} declined: {}", intent.id, intent.account_id, reason);
                intent.failure_reason = Some(reason);
                intent.set_status(RechargeStatus::Failed);
                let mut changes = ChangeSet::default();
                changes.put_recharge(&intent);
                self.ctx.commit(changes).await?;
                Ok(RechargeSettlement { intent, transaction: None })
            }
            (RechargeStatus::Pending, ChannelOutcome::Unknown { reason }) => {
                intent.failure_reason = Some(reason.clone());
                intent.set_status(RechargeStatus::Unresolved);
                let mut changes = ChangeSet::default();
                changes.put_recharge(&intent);
                self.ctx.commit(changes).await?;
                self.escalate(&intent, &reason).await;
                Ok(RechargeSettlement { intent, transaction: None })
            }
            (RechargeStatus::Unresolved, ChannelOutcome::Unknown { reason }) => {
                warn!("Recharge {} is still unresolved: {}", intent.id, reason);
                Ok(RechargeSettlement { intent, transaction: None })
            }
            (RechargeStatus::Failed, ChannelOutcome::Charged { external_transaction_id }) => {
                let reason = format!("channel charged {} for a declined recharge", external_transaction_id);
                self.escalate(&intent, &reason).await;
                Err(EngineError::ReconciliationRequired(reason))
            }
            (RechargeStatus::Succeeded | RechargeStatus::Failed, _) => Ok(RechargeSettlement { intent, transaction: None }),
        }
    }

    /// Debit the balance and hand the payout to the withdrawal consumer. The
    /// password check and the debit happen under one account lock.
    pub async fn withdraw(
        &self,
        caller: &Caller,
        amount: Money,
        payment_password: Option<&str>,
    ) -> EngineResult<LedgerTransaction> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount(amount));
        }
        let tx = {
            let _guard = self.ctx.locks.account(&caller.account_id).await;
            let mut account = self.ledger.load_or_open(&caller.account_id).await?;
            guard_payment_password(&self.ctx, &mut account, payment_password).await?;
            let mut changes = ChangeSet::default();
            let tx = stage_debit(&mut changes, &mut account, amount, TransactionKind::Withdraw, None, None)?;
            self.ctx.commit(changes).await?;
            tx
        };
        info!("Withdrawal of {} from {}, balance {}", amount, caller.account_id, tx.balance_after);

        self.ctx
            .publish(vec![DomainEvent::WithdrawalRequested(WithdrawalRequestedEvent {
                account_id: caller.account_id.to_string(),
                transaction_id: tx.id,
                amount,
                timestamp: Utc::now().timestamp(),
            })])
            .await;
        Ok(tx)
    }

    pub async fn set_payment_password(&self, caller: &Caller, password: &str, confirm: &str) -> EngineResult<()> {
        validate_password_format(password)?;
        if password != confirm {
            return Err(EngineError::Validation("payment passwords do not match".to_string()));
        }

        let _guard = self.ctx.locks.account(&caller.account_id).await;
        let mut account = self.ledger.load_or_open(&caller.account_id).await?;
        account.payment_password_hash = Some(hash_payment_password(&account.id, password));
        account.failed_password_attempts = 0;
        account.password_locked_until = None;
        account.updated_at = Utc::now();

        let mut changes = ChangeSet::default();
        changes.put_account(&account);
        self.ctx.commit(changes).await?;
        info!("Payment password set for {}", caller.account_id);
        Ok(())
    }

    /// `false` on a wrong password; an error when none is set or while the
    /// password is locked.
    pub async fn verify_payment_password(&self, caller: &Caller, password: &str) -> EngineResult<bool> {
        let _guard = self.ctx.locks.account(&caller.account_id).await;
        let mut account = self.ledger.load_or_open(&caller.account_id).await?;
        if !account.has_payment_password() {
            return Err(EngineError::StateConflict(format!(
                "account {} has no payment password",
                caller.account_id
            )));
        }
        match guard_payment_password(&self.ctx, &mut account, Some(password)).await {
            Ok(()) => Ok(true),
            Err(EngineError::InvalidPaymentPassword) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn load_recharge(&self, id: Uuid) -> EngineResult<RechargeIntent> {
        self.ctx.repo.get_recharge(id).await?.ok_or_else(|| EngineError::not_found("Recharge", id))
    }

    async fn escalate(&self, intent: &RechargeIntent, reason: &str) {
        error!("Reconciliation required for recharge {}: {}", intent.id, reason);
        self.ctx
            .publish(vec![DomainEvent::ReconciliationRequired(ReconciliationRequiredEvent {
                order_id: None,
                attempt_id: None,
                account_id: Some(intent.account_id.to_string()),
                reason: format!("recharge {}: {}", intent.reference(), reason),
                timestamp: Utc::now().timestamp(),
            })])
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_format() {
        assert!(validate_password_format("123456").is_ok());
        assert!(validate_password_format("12345").is_err());
        assert!(validate_password_format("12345a").is_err());
    }

    #[test]
    fn test_password_hash_is_salted_per_account() {
        let a = AccountId::new("user-1").unwrap();
        let b = AccountId::new("user-2").unwrap();
        assert_ne!(hash_payment_password(&a, "123456"), hash_payment_password(&b, "123456"));
        assert_eq!(hash_payment_password(&a, "123456").len(), 64);
    }

    #[test]
    fn test_check_payment_password() {
        let now = Utc::now();
        let mut account = Account::open(AccountId::new("user-1").unwrap());
        assert!(check_payment_password(&mut account, None, now).is_ok());

        account.payment_password_hash = Some(hash_payment_password(&account.id, "246810"));
        assert!(matches!(
            check_payment_password(&mut account, None, now),
            Err(EngineError::PaymentPasswordRequired)
        ));
        assert!(matches!(
            check_payment_password(&mut account, Some("000000"), now),
            Err(EngineError::InvalidPaymentPassword)
        ));
        assert_eq!(account.failed_password_attempts, 1);
        assert!(check_payment_password(&mut account, Some("246810"), now).is_ok());
        assert_eq!(account.failed_password_attempts, 0);
    }

    #[test]
    fn test_password_locks_after_repeated_failures() {
        let now = Utc::now();
        let mut account = Account::open(AccountId::new("user-1").unwrap());
        account.payment_password_hash = Some(hash_payment_password(&account.id, "246810"));

        for _ in 0..MAX_PASSWORD_FAILURES {
            assert!(matches!(
                check_payment_password(&mut account, Some("000000"), now),
                Err(EngineError::InvalidPaymentPassword)
            ));
        }
        assert!(account.password_locked_at(now));

        // The right password does not get through while locked.
        assert!(matches!(
            check_payment_password(&mut account, Some("246810"), now),
            Err(EngineError::PaymentPasswordLocked { .. })
        ));

        let later = now + chrono::Duration::minutes(PASSWORD_LOCKOUT_MINUTES + 1);
        assert!(check_payment_password(&mut account, Some("246810"), later).is_ok());
        assert_eq!(account.password_locked_until, None);
    }
}
