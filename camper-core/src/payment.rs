use async_trait::async_trait;
use camper_shared::Money;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::identity::AccountId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThirdPartyMethod {
    Wechat,
    Alipay,
}

impl ThirdPartyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThirdPartyMethod::Wechat => "WECHAT",
            ThirdPartyMethod::Alipay => "ALIPAY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Idempotency reference; the engine uses the payment attempt id so the
    /// outcome can be looked up again after a crash or timeout.
    pub reference: String,
    pub account_id: AccountId,
    pub amount: Money,
    pub method: ThirdPartyMethod,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeOutcome {
    Succeeded { external_transaction_id: String },
    Failed { reason: String },
}

/// Result of looking up an earlier charge by its reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeStatus {
    Succeeded { external_transaction_id: String },
    Failed { reason: String },
    /// The channel has the charge but has not settled it yet.
    Pending,
    /// The channel never received the charge.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundOutcome {
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Payment channel unreachable: {0}")]
    Transport(String),
    #[error("Payment channel rejected request: {0}")]
    Rejected(String),
}

/// Opaque third-party payment channel (WeChat Pay, Alipay, ...). Calls are
/// network calls with no atomicity against local state.
#[async_trait]
pub trait PaymentChannel: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ChannelError>;

    async fn refund(
        &self,
        external_transaction_id: &str,
        amount: Money,
    ) -> Result<RefundOutcome, ChannelError>;

    async fn charge_status(&self, reference: &str) -> Result<ChargeStatus, ChannelError>;
}

/// In-process channel for local runs and tests. Approves every charge up to
/// an optional ceiling and remembers outcomes so `charge_status` can answer.
pub struct SandboxChannel {
    decline_above: Option<Money>,
    charges: Mutex<HashMap<String, ChargeOutcome>>,
}

impl SandboxChannel {
    pub fn new() -> Self {
        Self {
            decline_above: None,
            charges: Mutex::new(HashMap::new()),
        }
    }

    pub fn declining_above(limit: Money) -> Self {
        Self {
            decline_above: Some(limit),
            charges: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, reference: &str, outcome: &ChargeOutcome) {
        let mut charges = self.charges.lock().unwrap_or_else(|e| e.into_inner());
        charges.insert(reference.to_string(), outcome.clone());
    }
}

impl Default for SandboxChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentChannel for SandboxChannel {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ChannelError> {
        let existing = {
            let charges = self.charges.lock().unwrap_or_else(|e| e.into_inner());
            charges.get(&request.reference).cloned()
        };
        if let Some(outcome) = existing {
            return Ok(outcome);
        }

        let outcome = match self.decline_above {
            Some(limit) if request.amount > limit => ChargeOutcome::Failed {
                reason: format!("amount {} exceeds sandbox limit {}", request.amount, limit),
            },
            _ => ChargeOutcome::Succeeded {
                external_transaction_id: format!("sandbox_{}", Uuid::new_v4().simple()),
            },
        };

        tracing::info!(
            "Sandbox {} charge {} for {}: {:?}",
            request.method.as_str(),
            request.reference,
            request.amount,
            outcome
        );
        self.record(&request.reference, &outcome);
        Ok(outcome)
    }

    async fn refund(
        &self,
        external_transaction_id: &str,
        amount: Money,
    ) -> Result<RefundOutcome, ChannelError> {
        tracing::info!("Sandbox refund of {} against {}", amount, external_transaction_id);
        Ok(RefundOutcome::Succeeded)
    }

    async fn charge_status(&self, reference: &str) -> Result<ChargeStatus, ChannelError> {
        let charges = self.charges.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match charges.get(reference) {
            Some(ChargeOutcome::Succeeded { external_transaction_id }) => ChargeStatus::Succeeded {
                external_transaction_id: external_transaction_id.clone(),
            },
            Some(ChargeOutcome::Failed { reason }) => ChargeStatus::Failed { reason: reason.clone() },
            None => ChargeStatus::NotFound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(reference: &str, amount: i64) -> ChargeRequest {
        ChargeRequest {
            reference: reference.to_string(),
            account_id: AccountId::new("user-1").unwrap(),
            amount: Money::from_minor(amount),
            method: ThirdPartyMethod::Wechat,
            description: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sandbox_charge_is_idempotent_per_reference() {
        let channel = SandboxChannel::new();

        let first = channel.charge(&request("att-1", 500)).await.unwrap();
        let second = channel.charge(&request("att-1", 500)).await.unwrap();
        assert_eq!(first, second);

        match channel.charge_status("att-1").await.unwrap() {
            ChargeStatus::Succeeded { .. } => {}
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(channel.charge_status("att-2").await.unwrap(), ChargeStatus::NotFound);
    }

    #[tokio::test]
    async fn test_sandbox_declines_above_limit() {
        let channel = SandboxChannel::declining_above(Money::from_minor(1000));

        let outcome = channel.charge(&request("att-1", 1500)).await.unwrap();
        assert!(matches!(outcome, ChargeOutcome::Failed { .. }));
        assert!(matches!(
            channel.charge_status("att-1").await.unwrap(),
            ChargeStatus::Failed { .. }
        ));
    }
}
