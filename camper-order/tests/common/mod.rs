#![allow(dead_code)]

use async_trait::async_trait;
use camper_catalog::{Catalog, Coupon, CouponKind, LineItem};
use camper_core::{
    AccountId, Caller, ChannelError, ChargeOutcome, ChargeRequest, ChargeStatus, PaymentChannel,
    RefundOutcome, ThirdPartyMethod,
};
use camper_order::{
    Contract, CreateOrderRequest, Engine, EngineConfig, InMemoryRepository, LedgerTransaction,
    OrderType, PaymentAttempt, PaymentPart, PaymentRequest, RecordingPublisher, SignatureArtifact,
    TransactionKind,
};
use camper_shared::{Masked, Money};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// How the next `charge` call behaves.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Decline(String),
    Transport(String),
    /// Never answers within any sane timeout.
    Hang,
}

/// Payment channel whose answers are queued up by the test.
#[derive(Default)]
pub struct ScriptedChannel {
    script: Mutex<VecDeque<Script>>,
    statuses: Mutex<HashMap<String, ChargeStatus>>,
    charges: Mutex<Vec<ChargeRequest>>,
    refunds: Mutex<Vec<(String, Money)>>,
}

impl ScriptedChannel {
    pub fn push(&self, script: Script) {
        self.script.lock().unwrap().push_back(script);
    }

    pub fn set_status(&self, reference: impl Into<String>, status: ChargeStatus) {
        self.statuses.lock().unwrap().insert(reference.into(), status);
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> Vec<(String, Money)> {
        self.refunds.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentChannel for ScriptedChannel {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ChannelError> {
        self.charges.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Script::Succeed);
        match next {
            Script::Succeed => {
                let external_transaction_id = format!("ext_{}", request.reference);
                self.set_status(
                    &request.reference,
                    ChargeStatus::Succeeded { external_transaction_id: external_transaction_id.clone() },
                );
                Ok(ChargeOutcome::Succeeded { external_transaction_id })
            }
            Script::Decline(reason) => {
                self.set_status(&request.reference, ChargeStatus::Failed { reason: reason.clone() });
                Ok(ChargeOutcome::Failed { reason })
            }
            Script::Transport(reason) => Err(ChannelError::Transport(reason)),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(ChannelError::Transport("hung".to_string()))
            }
        }
    }

    async fn refund(&self, external_transaction_id: &str, amount: Money) -> Result<RefundOutcome, ChannelError> {
        self.refunds.lock().unwrap().push((external_transaction_id.to_string(), amount));
        Ok(RefundOutcome::Succeeded)
    }

    async fn charge_status(&self, reference: &str) -> Result<ChargeStatus, ChannelError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .unwrap_or(ChargeStatus::NotFound))
    }
}

pub struct Harness {
    pub engine: Engine,
    pub repo: Arc<InMemoryRepository>,
    pub channel: Arc<ScriptedChannel>,
    pub events: Arc<RecordingPublisher>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        channel_timeout: Duration::from_millis(50),
        stale_attempt_after: chrono::Duration::zero(),
        signature_session_ttl: chrono::Duration::minutes(30),
        accept_signed_contracts: false,
    }
}

pub fn catalog() -> Catalog {
    Catalog::default().with_coupon(Coupon {
        id: "WELCOME50".to_string(),
        kind: CouponKind::Fixed { amount: Money::from_minor(50) },
        min_subtotal: Money::ZERO,
    })
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    let channel = Arc::new(ScriptedChannel::default());
    let events = Arc::new(RecordingPublisher::new());
    let engine = Engine::new(repo.clone(), channel.clone(), events.clone(), &catalog(), config);
    Harness { engine, repo, channel, events }
}

pub fn customer(id: &str) -> Caller {
    Caller::customer(AccountId::new(id).unwrap())
}

pub fn operator() -> Caller {
    Caller::operator(AccountId::new("ops-1").unwrap())
}

pub fn order_request(order_type: OrderType, unit_price: i64, quantity: i64) -> CreateOrderRequest {
    CreateOrderRequest {
        order_type,
        items: vec![LineItem::new("sku-1", "Test item", Money::from_minor(unit_price), quantity)],
        coupon_ids: Default::default(),
        insurance_id: None,
        contact: Some(camper_order::ContactInfo {
            name: "Zhang San".to_string(),
            phone: Masked("13900000000".to_string()),
        }),
        metadata: serde_json::json!({ "start_date": "2024-08-01", "end_date": "2024-08-04" }),
    }
}

pub fn split(balance: i64, third_party: i64) -> PaymentRequest {
    let mut parts = Vec::new();
    if balance > 0 {
        parts.push(PaymentPart::balance(Money::from_minor(balance)));
    }
    if third_party > 0 {
        parts.push(PaymentPart::third_party(Money::from_minor(third_party), ThirdPartyMethod::Wechat));
    }
    PaymentRequest { parts, payment_password: None }
}

impl Harness {
    pub async fn fund(&self, caller: &Caller, amount: i64) -> LedgerTransaction {
        self.engine
            .ledger
            .credit(&caller.account_id, Money::from_minor(amount), TransactionKind::Bonus, None)
            .await
            .unwrap()
    }

    pub async fn balance(&self, caller: &Caller) -> Money {
        self.engine.ledger.balance_of(&caller.account_id).await.unwrap()
    }

    pub async fn ledger(&self, caller: &Caller) -> Vec<LedgerTransaction> {
        self.engine
            .ledger
            .transactions(&caller.account_id, &Default::default())
            .await
            .unwrap()
    }

    pub async fn attempts(&self, caller: &Caller, order_id: Uuid) -> Vec<PaymentAttempt> {
        self.engine.payment_attempts(caller, order_id).await.unwrap()
    }

    /// Open a session, sign the exact rendered content, and verify.
    pub async fn sign_and_verify(&self, caller: &Caller, contract_id: Uuid) -> Contract {
        let contract = self.sign(caller, contract_id).await;
        self.engine.verify_contract_signature(caller, contract.id).await.unwrap()
    }

    pub async fn sign(&self, caller: &Caller, contract_id: Uuid) -> Contract {
        let contract = self.engine.get_contract(caller, contract_id).await.unwrap();
        let session = self
            .engine
            .open_signature_session(caller, contract_id, caller.account_id.clone())
            .await
            .unwrap();
        self.engine
            .complete_signature(
                caller,
                session.id,
                SignatureArtifact {
                    artifact_ref: format!("esign://{}", session.id),
                    signed_checksum: contract.content_checksum.clone(),
                },
            )
            .await
            .unwrap()
    }
}
