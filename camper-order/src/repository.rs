use async_trait::async_trait;
use camper_core::AccountId;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{
    Account, Contract, LedgerTransaction, Order, OrderStatus, OrderType, PaymentAttempt,
    RechargeIntent, SignatureSession, TransactionKind,
};

pub type RepoError = Box<dyn std::error::Error + Send + Sync>;
pub type RepoResult<T> = Result<T, RepoError>;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/// 1-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }

    pub fn limit(&self) -> usize {
        self.limit as usize
    }

    pub(crate) fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.offset()).take(self.limit()).collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: DEFAULT_PAGE_SIZE }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub customer_id: Option<AccountId>,
    pub status: Option<OrderStatus>,
    pub order_type: Option<OrderType>,
    /// `None` returns every match.
    pub page: Option<Page>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.customer_id.as_ref().map_or(true, |c| &order.customer_id == c)
            && self.status.map_or(true, |s| order.status == s)
            && self.order_type.map_or(true, |t| order.order_type == t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub kind: Option<TransactionKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: Option<Page>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &LedgerTransaction) -> bool {
        self.kind.map_or(true, |k| tx.kind == k)
            && self.since.map_or(true, |s| tx.created_at >= s)
            && self.until.map_or(true, |u| tx.created_at < u)
    }
}

/// Everything one engine step writes. A change set is applied all-or-nothing,
/// which is how a ledger entry and the state change it pays for stay together.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub orders: Vec<Order>,
    pub accounts: Vec<Account>,
    pub ledger: Vec<LedgerTransaction>,
    pub attempts: Vec<PaymentAttempt>,
    pub recharges: Vec<RechargeIntent>,
    pub contracts: Vec<Contract>,
    pub sessions: Vec<SignatureSession>,
}

impl ChangeSet {
    pub fn put_order(&mut self, order: &Order) -> &mut Self {
        self.orders.retain(|o| o.id != order.id);
        self.orders.push(order.clone());
        self
    }

    pub fn put_account(&mut self, account: &Account) -> &mut Self {
        self.accounts.retain(|a| a.id != account.id);
        self.accounts.push(account.clone());
        self
    }

    pub fn push_ledger(&mut self, tx: LedgerTransaction) -> &mut Self {
        self.ledger.push(tx);
        self
    }

    pub fn put_attempt(&mut self, attempt: &PaymentAttempt) -> &mut Self {
        self.attempts.retain(|a| a.id != attempt.id);
        self.attempts.push(attempt.clone());
        self
    }

    pub fn put_recharge(&mut self, intent: &RechargeIntent) -> &mut Self {
        self.recharges.retain(|r| r.id != intent.id);
        self.recharges.push(intent.clone());
        self
    }

    pub fn put_contract(&mut self, contract: &Contract) -> &mut Self {
        self.contracts.retain(|c| c.id != contract.id);
        self.contracts.push(contract.clone());
        self
    }

    pub fn put_session(&mut self, session: &SignatureSession) -> &mut Self {
        self.sessions.retain(|s| s.id != session.id);
        self.sessions.push(session.clone());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
            && self.accounts.is_empty()
            && self.ledger.is_empty()
            && self.attempts.is_empty()
            && self.recharges.is_empty()
            && self.contracts.is_empty()
            && self.sessions.is_empty()
    }
}

/// Durable storage for the engine. Reads return owned snapshots; all writes
/// go through `commit`.
#[async_trait]
pub trait EngineRepository: Send + Sync {
    async fn get_order(&self, id: Uuid) -> RepoResult<Option<Order>>;
    /// Newest first.
    async fn list_orders(&self, filter: &OrderFilter) -> RepoResult<Vec<Order>>;

    async fn get_account(&self, id: &AccountId) -> RepoResult<Option<Account>>;
    /// Oldest first.
    async fn list_transactions(
        &self,
        account_id: &AccountId,
        filter: &TransactionFilter,
    ) -> RepoResult<Vec<LedgerTransaction>>;

    async fn get_attempt(&self, id: Uuid) -> RepoResult<Option<PaymentAttempt>>;
    /// Oldest first.
    async fn list_attempts_for_order(&self, order_id: Uuid) -> RepoResult<Vec<PaymentAttempt>>;
    /// Attempts in PENDING or UNRESOLVED, oldest first.
    async fn list_open_attempts(&self) -> RepoResult<Vec<PaymentAttempt>>;

    async fn get_recharge(&self, id: Uuid) -> RepoResult<Option<RechargeIntent>>;
    /// Recharges in PENDING or UNRESOLVED, oldest first.
    async fn list_open_recharges(&self) -> RepoResult<Vec<RechargeIntent>>;

    async fn get_contract(&self, id: Uuid) -> RepoResult<Option<Contract>>;
    async fn list_contracts(&self, customer_id: Option<&AccountId>) -> RepoResult<Vec<Contract>>;

    async fn get_session(&self, id: Uuid) -> RepoResult<Option<SignatureSession>>;
    async fn list_sessions_for_contract(&self, contract_id: Uuid) -> RepoResult<Vec<SignatureSession>>;

    /// Apply every change or none. Ledger entries are insert-only; a
    /// duplicate ledger id fails the whole commit.
    async fn commit(&self, changes: ChangeSet) -> RepoResult<()>;
}
