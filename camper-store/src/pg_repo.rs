use async_trait::async_trait;
use camper_core::AccountId;
use camper_order::{
    Account, ChangeSet, Contract, EngineRepository, LedgerTransaction, Order, OrderFilter,
    PaymentAttempt, RechargeIntent, RepoResult, SignatureSession, TransactionFilter, TransactionKind,
};
use camper_shared::Money;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

/// Postgres-backed engine storage. Every `commit` is one SQL transaction.
pub struct PgEngineRepository {
    pool: PgPool,
}

impl PgEngineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: String,
    balance: i64,
    payment_password_hash: Option<String>,
    failed_password_attempts: i32,
    password_locked_until: Option<DateTime<Utc>>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = camper_order::RepoError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: AccountId::new(row.id)?,
            balance: Money::from_minor(row.balance),
            payment_password_hash: row.payment_password_hash,
            failed_password_attempts: u32::try_from(row.failed_password_attempts)?,
            password_locked_until: row.password_locked_until,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    account_id: String,
    kind: String,
    amount: i64,
    balance_after: i64,
    related_order_id: Option<Uuid>,
    related_attempt_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerTransaction {
    type Error = camper_order::RepoError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let kind = TransactionKind::parse(&row.kind)
            .ok_or_else(|| format!("unknown transaction kind {} on {}", row.kind, row.id))?;
        Ok(LedgerTransaction {
            id: row.id,
            account_id: AccountId::new(row.account_id)?,
            kind,
            amount: Money::from_minor(row.amount),
            balance_after: Money::from_minor(row.balance_after),
            related_order_id: row.related_order_id,
            related_attempt_id: row.related_attempt_id,
            created_at: row.created_at,
        })
    }
}

const LEDGER_COLUMNS: &str =
    "id, account_id, kind, amount, balance_after, related_order_id, related_attempt_id, created_at";

#[async_trait]
impl EngineRepository for PgEngineRepository {
    async fn get_order(&self, id: Uuid) -> RepoResult<Option<Order>> {
        let doc = sqlx::query_scalar::<_, Json<Order>>("SELECT doc FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc.map(|Json(order)| order))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> RepoResult<Vec<Order>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("SELECT doc FROM orders WHERE TRUE");
        if let Some(customer_id) = &filter.customer_id {
            query.push(" AND customer_id = ").push_bind(customer_id.as_str().to_string());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(order_type) = filter.order_type {
            query.push(" AND order_type = ").push_bind(order_type.as_str());
        }
        query.push(" ORDER BY created_at DESC, id");
        if let Some(page) = filter.page {
            query.push(" LIMIT ").push_bind(page.limit() as i64);
            query.push(" OFFSET ").push_bind(page.offset() as i64);
        }

        let docs = query
            .build_query_scalar::<Json<Order>>()
            .fetch_all(&self.pool)
            .await?;
        Ok(docs.into_iter().map(|Json(order)| order).collect())
    }

    async fn get_account(&self, id: &AccountId) -> RepoResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, balance, payment_password_hash, failed_password_attempts, password_locked_until, active, \
             created_at, updated_at FROM accounts WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Account::try_from).transpose()
    }

    async fn list_transactions(
        &self,
        account_id: &AccountId,
        filter: &TransactionFilter,
    ) -> RepoResult<Vec<LedgerTransaction>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM ledger_transactions WHERE account_id = ",
            LEDGER_COLUMNS
        ));
        query.push_bind(account_id.as_str().to_string());
        if let Some(kind) = filter.kind {
            query.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(since) = filter.since {
            query.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            query.push(" AND created_at < ").push_bind(until);
        }
        query.push(" ORDER BY seq");
        if let Some(page) = filter.page {
            query.push(" LIMIT ").push_bind(page.limit() as i64);
            query.push(" OFFSET ").push_bind(page.offset() as i64);
        }

        let rows = query.build_query_as::<LedgerRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(LedgerTransaction::try_from).collect()
    }

    async fn get_attempt(&self, id: Uuid) -> RepoResult<Option<PaymentAttempt>> {
        let doc = sqlx::query_scalar::<_, Json<PaymentAttempt>>("SELECT doc FROM payment_attempts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc.map(|Json(attempt)| attempt))
    }

    async fn list_attempts_for_order(&self, order_id: Uuid) -> RepoResult<Vec<PaymentAttempt>> {
        let docs = sqlx::query_scalar::<_, Json<PaymentAttempt>>(
            "SELECT doc FROM payment_attempts WHERE order_id = $1 ORDER BY created_at, id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(docs.into_iter().map(|Json(attempt)| attempt).collect())
    }

    async fn list_open_attempts(&self) -> RepoResult<Vec<PaymentAttempt>> {
        let docs = sqlx::query_scalar::<_, Json<PaymentAttempt>>(
            "SELECT doc FROM payment_attempts WHERE status IN ('PENDING', 'UNRESOLVED') ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(docs.into_iter().map(|Json(attempt)| attempt).collect())
    }

    async fn get_recharge(&self, id: Uuid) -> RepoResult<Option<RechargeIntent>> {
        let doc = sqlx::query_scalar::<_, Json<RechargeIntent>>("SELECT doc FROM recharge_intents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc.map(|Json(intent)| intent))
    }

    async fn list_open_recharges(&self) -> RepoResult<Vec<RechargeIntent>> {
        let docs = sqlx::query_scalar::<_, Json<RechargeIntent>>(
            "SELECT doc FROM recharge_intents WHERE status IN ('PENDING', 'UNRESOLVED') ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(docs.into_iter().map(|Json(intent)| intent).collect())
    }

    async fn get_contract(&self, id: Uuid) -> RepoResult<Option<Contract>> {
        let doc = sqlx::query_scalar::<_, Json<Contract>>("SELECT doc FROM contracts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc.map(|Json(contract)| contract))
    }

    async fn list_contracts(&self, customer_id: Option<&AccountId>) -> RepoResult<Vec<Contract>> {
        let docs = match customer_id {
            Some(customer_id) => {
                sqlx::query_scalar::<_, Json<Contract>>(
                    "SELECT doc FROM contracts WHERE customer_id = $1 ORDER BY created_at DESC",
                )
                .bind(customer_id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, Json<Contract>>("SELECT doc FROM contracts ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(docs.into_iter().map(|Json(contract)| contract).collect())
    }

    async fn get_session(&self, id: Uuid) -> RepoResult<Option<SignatureSession>> {
        let doc = sqlx::query_scalar::<_, Json<SignatureSession>>("SELECT doc FROM signature_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc.map(|Json(session)| session))
    }

    async fn list_sessions_for_contract(&self, contract_id: Uuid) -> RepoResult<Vec<SignatureSession>> {
        let docs = sqlx::query_scalar::<_, Json<SignatureSession>>(
            "SELECT doc FROM signature_sessions WHERE contract_id = $1 ORDER BY created_at",
        )
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(docs.into_iter().map(|Json(session)| session).collect())
    }

    async fn commit(&self, changes: ChangeSet) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        for order in &changes.orders {
            sqlx::query(
                r#"
                INSERT INTO orders (id, customer_id, order_type, status, amount_due, amount_paid, doc, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    amount_due = EXCLUDED.amount_due,
                    amount_paid = EXCLUDED.amount_paid,
                    doc = EXCLUDED.doc,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(order.id)
            .bind(order.customer_id.as_str())
            .bind(order.order_type.as_str())
            .bind(order.status.as_str())
            .bind(order.amount_due.minor())
            .bind(order.amount_paid.minor())
            .bind(Json(order))
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for account in &changes.accounts {
            sqlx::query(
                r#"
                INSERT INTO accounts (id, balance, payment_password_hash, failed_password_attempts,
                                      password_locked_until, active, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    balance = EXCLUDED.balance,
                    payment_password_hash = EXCLUDED.payment_password_hash,
                    failed_password_attempts = EXCLUDED.failed_password_attempts,
                    password_locked_until = EXCLUDED.password_locked_until,
                    active = EXCLUDED.active,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(account.id.as_str())
            .bind(account.balance.minor())
            .bind(account.payment_password_hash.as_deref())
            .bind(i32::try_from(account.failed_password_attempts)?)
            .bind(account.password_locked_until)
            .bind(account.active)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        // Insert-only: a duplicate id aborts the transaction.
        for entry in &changes.ledger {
            sqlx::query(&format!(
                "INSERT INTO ledger_transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                LEDGER_COLUMNS
            ))
            .bind(entry.id)
            .bind(entry.account_id.as_str())
            .bind(entry.kind.as_str())
            .bind(entry.amount.minor())
            .bind(entry.balance_after.minor())
            .bind(entry.related_order_id)
            .bind(entry.related_attempt_id)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for attempt in &changes.attempts {
            sqlx::query(
                r#"
                INSERT INTO payment_attempts (id, order_id, account_id, status, doc, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    doc = EXCLUDED.doc,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(attempt.id)
            .bind(attempt.order_id)
            .bind(attempt.account_id.as_str())
            .bind(attempt.status.as_str())
            .bind(Json(attempt))
            .bind(attempt.created_at)
            .bind(attempt.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for intent in &changes.recharges {
            sqlx::query(
                r#"
                INSERT INTO recharge_intents (id, account_id, status, doc, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    doc = EXCLUDED.doc,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(intent.id)
            .bind(intent.account_id.as_str())
            .bind(intent.status.as_str())
            .bind(Json(intent))
            .bind(intent.created_at)
            .bind(intent.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for contract in &changes.contracts {
            sqlx::query(
                r#"
                INSERT INTO contracts (id, order_id, customer_id, doc, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET
                    doc = EXCLUDED.doc,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(contract.id)
            .bind(contract.order_id)
            .bind(contract.customer_id.as_str())
            .bind(Json(contract))
            .bind(contract.created_at)
            .bind(contract.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for session in &changes.sessions {
            sqlx::query(
                r#"
                INSERT INTO signature_sessions (id, contract_id, doc, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc
                "#,
            )
            .bind(session.id)
            .bind(session.contract_id)
            .bind(Json(session))
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Committed {} orders, {} accounts, {} ledger entries, {} attempts, {} recharges, {} contracts, {} sessions",
            changes.orders.len(),
            changes.accounts.len(),
            changes.ledger.len(),
            changes.attempts.len(),
            changes.recharges.len(),
            changes.contracts.len(),
            changes.sessions.len()
        );
        Ok(())
    }
}
