use uuid::Uuid;
use crate::money::Money;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct OrderStatusChangedEvent {
    pub order_id: Uuid,
    pub customer_id: String,
    pub from_status: String,
    pub to_status: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct OrderPaidEvent {
    pub order_id: Uuid,
    pub attempt_id: Uuid,
    pub customer_id: String,
    pub amount_paid: Money,
    pub balance_portion: Money,
    pub third_party_portion: Money,
    pub external_transaction_id: Option<String>,
    pub timestamp: i64,
}

/// Signal that the channel-funded portion of a cancelled order must be
/// returned through the payment channel. Consumers execute the refund.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct RefundRequestedEvent {
    pub order_id: Uuid,
    pub attempt_id: Uuid,
    pub external_transaction_id: String,
    pub amount: Money,
    pub method: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct ReconciliationRequiredEvent {
    pub order_id: Option<Uuid>,
    pub attempt_id: Option<Uuid>,
    pub account_id: Option<String>,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct ContractSignedEvent {
    pub contract_id: Uuid,
    pub order_id: Uuid,
    pub signer_account_id: String,
    pub verified: bool,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct WithdrawalRequestedEvent {
    pub account_id: String,
    pub transaction_id: Uuid,
    pub amount: Money,
    pub timestamp: i64,
}
