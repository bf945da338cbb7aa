use camper_core::AccountId;
use camper_shared::Money;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::models::{Account, LedgerTransaction, TransactionKind};
use crate::repository::{ChangeSet, TransactionFilter};

/// Append-only record of balance movements. Every balance change is one
/// ledger entry committed together with the new balance.
#[derive(Clone)]
pub struct Ledger {
    ctx: Context,
}

impl Ledger {
    pub(crate) fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub async fn credit(
        &self,
        account_id: &AccountId,
        amount: Money,
        kind: TransactionKind,
        related_order_id: Option<Uuid>,
    ) -> EngineResult<LedgerTransaction> {
        let _guard = self.ctx.locks.account(account_id).await;
        let mut account = self.load_or_open(account_id).await?;
        let mut changes = ChangeSet::default();
        let tx = stage_credit(&mut changes, &mut account, amount, kind, related_order_id, None)?;
        self.ctx.commit(changes).await?;
        info!("Credited {} to {} ({}), balance {}", amount, account_id, kind.as_str(), tx.balance_after);
        Ok(tx)
    }

    pub async fn debit(
        &self,
        account_id: &AccountId,
        amount: Money,
        kind: TransactionKind,
        related_order_id: Option<Uuid>,
    ) -> EngineResult<LedgerTransaction> {
        let _guard = self.ctx.locks.account(account_id).await;
        let mut account = self.load_or_open(account_id).await?;
        let mut changes = ChangeSet::default();
        let tx = stage_debit(&mut changes, &mut account, amount, kind, related_order_id, None)?;
        self.ctx.commit(changes).await?;
        info!("Debited {} from {} ({}), balance {}", amount, account_id, kind.as_str(), tx.balance_after);
        Ok(tx)
    }

    /// Zero for accounts that have never been used.
    pub async fn balance_of(&self, account_id: &AccountId) -> EngineResult<Money> {
        Ok(self
            .ctx
            .repo
            .get_account(account_id)
            .await?
            .map(|a| a.balance)
            .unwrap_or(Money::ZERO))
    }

    pub async fn transactions(
        &self,
        account_id: &AccountId,
        filter: &TransactionFilter,
    ) -> EngineResult<Vec<LedgerTransaction>> {
        Ok(self.ctx.repo.list_transactions(account_id, filter).await?)
    }

    /// Recompute the balance from the ledger and compare it with the cached
    /// account balance.
    pub async fn verify_balance(&self, account_id: &AccountId) -> EngineResult<Money> {
        let entries = self.ctx.repo.list_transactions(account_id, &TransactionFilter::default()).await?;
        let sum = Money::checked_sum(entries.iter().map(|tx| tx.amount))
            .ok_or_else(|| EngineError::ReconciliationRequired(format!("ledger sum overflow for {}", account_id)))?;
        let cached = self.balance_of(account_id).await?;
        if sum != cached {
            tracing::error!("Balance drift for {}: ledger {} vs account {}", account_id, sum, cached);
            return Err(EngineError::ReconciliationRequired(format!(
                "account {} balance {} does not match ledger sum {}",
                account_id, cached, sum
            )));
        }
        Ok(sum)
    }

    /// Existing account, or a fresh unsaved one. Callers hold the account lock.
    pub(crate) async fn load_or_open(&self, account_id: &AccountId) -> EngineResult<Account> {
        Ok(self
            .ctx
            .repo
            .get_account(account_id)
            .await?
            .unwrap_or_else(|| Account::open(account_id.clone())))
    }
}

/// Stage a credit into `changes` and update `account` in place.
pub(crate) fn stage_credit(
    changes: &mut ChangeSet,
    account: &mut Account,
    amount: Money,
    kind: TransactionKind,
    related_order_id: Option<Uuid>,
    related_attempt_id: Option<Uuid>,
) -> EngineResult<LedgerTransaction> {
    if !amount.is_positive() {
        return Err(EngineError::InvalidAmount(amount));
    }
    stage_entry(changes, account, amount, kind, related_order_id, related_attempt_id)
}

/// Stage a debit; fails without staging anything when the balance is short.
pub(crate) fn stage_debit(
    changes: &mut ChangeSet,
    account: &mut Account,
    amount: Money,
    kind: TransactionKind,
    related_order_id: Option<Uuid>,
    related_attempt_id: Option<Uuid>,
) -> EngineResult<LedgerTransaction> {
    if !amount.is_positive() {
        return Err(EngineError::InvalidAmount(amount));
    }
    if !account.active {
        return Err(EngineError::StateConflict(format!("account {} is inactive", account.id)));
    }
    if account.balance < amount {
        return Err(EngineError::InsufficientBalance {
            requested: amount,
            available: account.balance,
        });
    }
    let signed = amount
        .checked_neg()
        .ok_or_else(|| EngineError::Validation("amount overflow".to_string()))?;
    stage_entry(changes, account, signed, kind, related_order_id, related_attempt_id)
}

fn stage_entry(
    changes: &mut ChangeSet,
    account: &mut Account,
    signed_amount: Money,
    kind: TransactionKind,
    related_order_id: Option<Uuid>,
    related_attempt_id: Option<Uuid>,
) -> EngineResult<LedgerTransaction> {
    let balance_after = account
        .balance
        .checked_add(signed_amount)
        .ok_or_else(|| EngineError::Validation(format!("balance overflow for {}", account.id)))?;
    let now = Utc::now();
    account.balance = balance_after;
    account.updated_at = now;

    let tx = LedgerTransaction {
        id: Uuid::new_v4(),
        account_id: account.id.clone(),
        kind,
        amount: signed_amount,
        balance_after,
        related_order_id,
        related_attempt_id,
        created_at: now,
    };
    changes.push_ledger(tx.clone());
    changes.put_account(account);
    Ok(tx)
}
