use camper_catalog::PricingError;
use camper_shared::Money;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::PartChannel;
use crate::repository::RepoError;

/// Stable, machine-readable classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidPricingInput,
    ValidationError,
    NotFound,
    Forbidden,
    StateConflict,
    InsufficientBalance,
    AmountMismatch,
    ExternalChannelError,
    SignatureVerificationFailed,
    ReconciliationRequired,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidPricingInput => "INVALID_PRICING_INPUT",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::StateConflict => "STATE_CONFLICT",
            ErrorKind::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorKind::AmountMismatch => "AMOUNT_MISMATCH",
            ErrorKind::ExternalChannelError => "EXTERNAL_CHANNEL_ERROR",
            ErrorKind::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            ErrorKind::ReconciliationRequired => "RECONCILIATION_REQUIRED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid pricing input: {0}")]
    InvalidPricingInput(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Money),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Invalid state transition: {0}")]
    StateConflict(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Money, available: Money },

    #[error("Payment parts sum to {actual} but {expected} is due")]
    AmountMismatch { expected: Money, actual: Money },

    #[error("Third-party payment channel failed: {reason}")]
    ExternalChannel { reason: String, outcome_unknown: bool },

    #[error("No contract template for order type {0}")]
    UnsupportedContractType(String),

    #[error("Contract {0} is already signed")]
    ContractAlreadySigned(Uuid),

    #[error("Contract {0} already has an open signature session")]
    SessionAlreadyOpen(Uuid),

    #[error("Signature session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Signature session {0} has expired")]
    SessionExpired(Uuid),

    #[error("Signature verification failed for contract {0}")]
    SignatureVerificationFailed(Uuid),

    #[error("Reconciliation required: {0}")]
    ReconciliationRequired(String),

    #[error("Payment password required")]
    PaymentPasswordRequired,

    #[error("Invalid payment password")]
    InvalidPaymentPassword,

    #[error("Payment password locked until {until}")]
    PaymentPasswordLocked { until: DateTime<Utc> },

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound { entity, id: id.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidPricingInput(_) => ErrorKind::InvalidPricingInput,
            EngineError::Validation(_)
            | EngineError::InvalidAmount(_)
            | EngineError::UnsupportedContractType(_)
            | EngineError::PaymentPasswordRequired
            | EngineError::InvalidPaymentPassword => ErrorKind::ValidationError,
            EngineError::NotFound { .. } | EngineError::SessionNotFound(_) => ErrorKind::NotFound,
            EngineError::Forbidden(_) | EngineError::PaymentPasswordLocked { .. } => ErrorKind::Forbidden,
            EngineError::StateConflict(_)
            | EngineError::ContractAlreadySigned(_)
            | EngineError::SessionAlreadyOpen(_)
            | EngineError::SessionExpired(_) => ErrorKind::StateConflict,
            EngineError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            EngineError::AmountMismatch { .. } => ErrorKind::AmountMismatch,
            EngineError::ExternalChannel { .. } => ErrorKind::ExternalChannelError,
            EngineError::SignatureVerificationFailed(_) => ErrorKind::SignatureVerificationFailed,
            EngineError::ReconciliationRequired(_) => ErrorKind::ReconciliationRequired,
            EngineError::Repository(_) => ErrorKind::Internal,
        }
    }

    /// The payment leg a payment failure belongs to.
    pub fn failed_leg(&self) -> Option<PartChannel> {
        match self {
            EngineError::InsufficientBalance { .. }
            | EngineError::PaymentPasswordRequired
            | EngineError::InvalidPaymentPassword
            | EngineError::PaymentPasswordLocked { .. } => Some(PartChannel::Balance),
            EngineError::ExternalChannel { .. } => Some(PartChannel::ThirdParty),
            _ => None,
        }
    }
}

impl From<PricingError> for EngineError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::InvalidPricingInput(msg) => EngineError::InvalidPricingInput(msg),
        }
    }
}
