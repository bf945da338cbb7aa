use camper_catalog::{Catalog, PriceQuote, PricingCalculator, PricingInput};
use camper_core::{AccountId, Caller, PaymentChannel};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::context::Context;
use crate::contract::{ContractManager, ContractPreview};
use crate::error::EngineResult;
use crate::events::EventPublisher;
use crate::ledger::Ledger;
use crate::locks::KeyedLocks;
use crate::manager::{CreateOrderRequest, OrderManager};
use crate::models::{Contract, Order, PaymentAttempt, SignatureArtifact, SignatureSession};
use crate::orchestrator::{ChannelOutcome, PaymentConfirmation, PaymentOrchestrator, PaymentRequest, PaymentResolution};
use crate::recovery::{RecoveryPass, RecoveryReport};
use crate::repository::{EngineRepository, OrderFilter};
use crate::wallet::WalletService;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on a single payment channel call.
    pub channel_timeout: Duration,
    /// PENDING attempts older than this are picked up by recovery.
    pub stale_attempt_after: chrono::Duration,
    pub signature_session_ttl: chrono::Duration,
    /// Let SIGNED (not yet verified) contracts clear order confirmation.
    pub accept_signed_contracts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_timeout: Duration::from_secs(10),
            stale_attempt_after: chrono::Duration::minutes(5),
            signature_session_ttl: chrono::Duration::minutes(30),
            accept_signed_contracts: false,
        }
    }
}

/// Entry point for every order, payment, contract and wallet operation.
#[derive(Clone)]
pub struct Engine {
    pub orders: OrderManager,
    pub payments: PaymentOrchestrator,
    pub contracts: ContractManager,
    pub wallet: WalletService,
    pub ledger: Ledger,
    pub recovery: RecoveryPass,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn EngineRepository>,
        channel: Arc<dyn PaymentChannel>,
        events: Arc<dyn EventPublisher>,
        catalog: &Catalog,
        config: EngineConfig,
    ) -> Self {
        let ctx = Context {
            repo,
            locks: Arc::new(KeyedLocks::new()),
            events,
            config: Arc::new(config),
        };
        let ledger = Ledger::new(ctx.clone());
        let orders = OrderManager::new(ctx.clone(), Arc::new(PricingCalculator::new(catalog)), ledger.clone());
        let payments = PaymentOrchestrator::new(ctx.clone(), ledger.clone(), channel.clone());
        let contracts = ContractManager::new(ctx.clone());
        let wallet = WalletService::new(ctx.clone(), ledger.clone(), channel);
        let recovery = RecoveryPass::new(ctx, payments.clone(), orders.clone(), wallet.clone());

        Self { orders, payments, contracts, wallet, ledger, recovery }
    }

    pub fn calculate_price(&self, input: &PricingInput) -> EngineResult<PriceQuote> {
        self.orders.calculate_price(input)
    }

    pub async fn create_order(&self, caller: &Caller, request: CreateOrderRequest) -> EngineResult<Order> {
        self.orders.create_order(caller, request).await
    }

    pub async fn get_order(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Order> {
        self.orders.get_order(caller, order_id).await
    }

    pub async fn list_orders(&self, caller: &Caller, filter: OrderFilter) -> EngineResult<Vec<Order>> {
        self.orders.list_orders(caller, filter).await
    }

    pub async fn attempt_payment(
        &self,
        caller: &Caller,
        order_id: Uuid,
        request: PaymentRequest,
    ) -> EngineResult<PaymentResolution> {
        self.payments.attempt_payment(caller, order_id, request).await
    }

    pub async fn confirm_payment(
        &self,
        caller: &Caller,
        order_id: Uuid,
        confirmation: PaymentConfirmation,
    ) -> EngineResult<PaymentResolution> {
        self.payments.confirm_payment(caller, order_id, confirmation).await
    }

    pub async fn resolve_attempt(&self, attempt_id: Uuid, outcome: ChannelOutcome) -> EngineResult<PaymentResolution> {
        self.payments.resolve_attempt(attempt_id, outcome).await
    }

    pub async fn payment_attempts(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Vec<PaymentAttempt>> {
        self.payments.attempts_for_order(caller, order_id).await
    }

    /// Open attempts are settled with the channel before the order is
    /// cancelled, so money in flight is never lost.
    pub async fn cancel_order(&self, caller: &Caller, order_id: Uuid, reason: Option<String>) -> EngineResult<Order> {
        self.orders.get_order(caller, order_id).await?;
        self.payments.reconcile_order(order_id).await?;
        self.orders.cancel_order(caller, order_id, reason).await
    }

    pub async fn confirm_order(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Order> {
        self.orders.confirm_order(caller, order_id).await
    }

    pub async fn reject_order(&self, caller: &Caller, order_id: Uuid, reason: Option<String>) -> EngineResult<Order> {
        if caller.is_operator() {
            self.payments.reconcile_order(order_id).await?;
        }
        self.orders.reject_order(caller, order_id, reason).await
    }

    pub async fn complete_order(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Order> {
        self.orders.complete_order(caller, order_id).await
    }

    pub async fn preview_contract(&self, caller: &Caller, order_id: Uuid) -> EngineResult<ContractPreview> {
        self.contracts.preview(caller, order_id).await
    }

    pub async fn generate_contract(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Contract> {
        self.contracts.generate(caller, order_id).await
    }

    pub async fn get_contract(&self, caller: &Caller, contract_id: Uuid) -> EngineResult<Contract> {
        self.contracts.get_contract(caller, contract_id).await
    }

    pub async fn list_contracts(&self, caller: &Caller, customer_id: Option<AccountId>) -> EngineResult<Vec<Contract>> {
        self.contracts.list_contracts(caller, customer_id).await
    }

    pub async fn open_signature_session(
        &self,
        caller: &Caller,
        contract_id: Uuid,
        signer: AccountId,
    ) -> EngineResult<SignatureSession> {
        self.contracts.open_signature_session(caller, contract_id, signer).await
    }

    pub async fn complete_signature(
        &self,
        caller: &Caller,
        session_id: Uuid,
        artifact: SignatureArtifact,
    ) -> EngineResult<Contract> {
        self.contracts.complete_signature(caller, session_id, artifact).await
    }

    pub async fn verify_contract_signature(&self, caller: &Caller, contract_id: Uuid) -> EngineResult<Contract> {
        self.contracts.verify(caller, contract_id).await
    }

    pub async fn run_recovery(&self) -> RecoveryReport {
        self.recovery.run().await
    }
}
