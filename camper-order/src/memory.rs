use async_trait::async_trait;
use camper_core::AccountId;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    Account, Contract, LedgerTransaction, Order, PaymentAttempt, RechargeIntent, SignatureSession,
};
use crate::repository::{
    ChangeSet, EngineRepository, OrderFilter, RepoResult, TransactionFilter,
};

#[derive(Default)]
struct MemoryState {
    orders: HashMap<Uuid, Order>,
    accounts: HashMap<AccountId, Account>,
    ledger: Vec<LedgerTransaction>,
    ledger_ids: HashSet<Uuid>,
    attempts: HashMap<Uuid, PaymentAttempt>,
    recharges: HashMap<Uuid, RechargeIntent>,
    contracts: HashMap<Uuid, Contract>,
    sessions: HashMap<Uuid, SignatureSession>,
}

/// Repository kept entirely in process memory. Used by tests and by the API
/// when no database is configured.
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineRepository for InMemoryRepository {
    async fn get_order(&self, id: Uuid) -> RepoResult<Option<Order>> {
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn list_orders(&self, filter: &OrderFilter) -> RepoResult<Vec<Order>> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state.orders.values().filter(|o| filter.matches(o)).cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(match filter.page {
            Some(page) => page.slice(orders),
            None => orders,
        })
    }

    async fn get_account(&self, id: &AccountId) -> RepoResult<Option<Account>> {
        Ok(self.state.read().await.accounts.get(id).cloned())
    }

    async fn list_transactions(
        &self,
        account_id: &AccountId,
        filter: &TransactionFilter,
    ) -> RepoResult<Vec<LedgerTransaction>> {
        let state = self.state.read().await;
        // `ledger` is kept in insertion order.
        let txs: Vec<LedgerTransaction> = state
            .ledger
            .iter()
            .filter(|tx| &tx.account_id == account_id && filter.matches(tx))
            .cloned()
            .collect();
        Ok(match filter.page {
            Some(page) => page.slice(txs),
            None => txs,
        })
    }

    async fn get_attempt(&self, id: Uuid) -> RepoResult<Option<PaymentAttempt>> {
        Ok(self.state.read().await.attempts.get(&id).cloned())
    }

    async fn list_attempts_for_order(&self, order_id: Uuid) -> RepoResult<Vec<PaymentAttempt>> {
        let state = self.state.read().await;
        let mut attempts: Vec<PaymentAttempt> =
            state.attempts.values().filter(|a| a.order_id == order_id).cloned().collect();
        attempts.sort_by_key(|a| a.created_at);
        Ok(attempts)
    }

    async fn list_open_attempts(&self) -> RepoResult<Vec<PaymentAttempt>> {
        let state = self.state.read().await;
        let mut attempts: Vec<PaymentAttempt> =
            state.attempts.values().filter(|a| a.status.is_open()).cloned().collect();
        attempts.sort_by_key(|a| a.created_at);
        Ok(attempts)
    }

    async fn get_recharge(&self, id: Uuid) -> RepoResult<Option<RechargeIntent>> {
        Ok(self.state.read().await.recharges.get(&id).cloned())
    }

    async fn list_open_recharges(&self) -> RepoResult<Vec<RechargeIntent>> {
        let state = self.state.read().await;
        let mut recharges: Vec<RechargeIntent> =
            state.recharges.values().filter(|r| r.status.is_open()).cloned().collect();
        recharges.sort_by_key(|r| r.created_at);
        Ok(recharges)
    }

    async fn get_contract(&self, id: Uuid) -> RepoResult<Option<Contract>> {
        Ok(self.state.read().await.contracts.get(&id).cloned())
    }

    async fn list_contracts(&self, customer_id: Option<&AccountId>) -> RepoResult<Vec<Contract>> {
        let state = self.state.read().await;
        let mut contracts: Vec<Contract> = state
            .contracts
            .values()
            .filter(|c| customer_id.map_or(true, |id| &c.customer_id == id))
            .cloned()
            .collect();
        contracts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(contracts)
    }

    async fn get_session(&self, id: Uuid) -> RepoResult<Option<SignatureSession>> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn list_sessions_for_contract(&self, contract_id: Uuid) -> RepoResult<Vec<SignatureSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<SignatureSession> =
            state.sessions.values().filter(|s| s.contract_id == contract_id).cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn commit(&self, changes: ChangeSet) -> RepoResult<()> {
        let mut state = self.state.write().await;

        // Validate before touching anything so a rejected commit leaves no trace.
        let mut incoming = HashSet::with_capacity(changes.ledger.len());
        for tx in &changes.ledger {
            if state.ledger_ids.contains(&tx.id) || !incoming.insert(tx.id) {
                return Err(format!("duplicate ledger transaction {}", tx.id).into());
            }
        }

        for order in changes.orders {
            state.orders.insert(order.id, order);
        }
        for account in changes.accounts {
            state.accounts.insert(account.id.clone(), account);
        }
        for tx in changes.ledger {
            state.ledger_ids.insert(tx.id);
            state.ledger.push(tx);
        }
        for attempt in changes.attempts {
            state.attempts.insert(attempt.id, attempt);
        }
        for intent in changes.recharges {
            state.recharges.insert(intent.id, intent);
        }
        for contract in changes.contracts {
            state.contracts.insert(contract.id, contract);
        }
        for session in changes.sessions {
            state.sessions.insert(session.id, session);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionKind;
    use camper_shared::Money;
    use chrono::Utc;

    fn entry(account: &AccountId, amount: i64, balance_after: i64) -> LedgerTransaction {
        LedgerTransaction {
            id: Uuid::new_v4(),
            account_id: account.clone(),
            kind: TransactionKind::Recharge,
            amount: Money::from_minor(amount),
            balance_after: Money::from_minor(balance_after),
            related_order_id: None,
            related_attempt_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let repo = InMemoryRepository::new();
        let id = AccountId::new("user-1").unwrap();
        let first = entry(&id, 100, 100);

        let mut changes = ChangeSet::default();
        changes.push_ledger(first.clone());
        repo.commit(changes).await.unwrap();

        let mut account = Account::open(id.clone());
        account.balance = Money::from_minor(200);
        let mut changes = ChangeSet::default();
        changes.put_account(&account);
        changes.push_ledger(entry(&id, 100, 200));
        changes.push_ledger(first);
        assert!(repo.commit(changes).await.is_err());

        assert!(repo.get_account(&id).await.unwrap().is_none());
        let txs = repo.list_transactions(&id, &TransactionFilter::default()).await.unwrap();
        assert_eq!(txs.len(), 1);
    }
}
